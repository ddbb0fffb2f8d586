use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// A stored email template owned by a dashboard user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subject: String,
    pub body_html: String,

    #[serde(default)]
    pub body_text: Option<String>,

    #[serde(default)]
    pub from_address: Option<String>,
}

/// A product user an email is rendered for.
///
/// `attributes` holds the user's top-level fields and may contain a nested
/// `traits` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub attributes: Map<String, JsonValue>,
}

impl Recipient {
    pub fn new(id: Uuid, email: Option<String>) -> Self {
        Self {
            id,
            email,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: JsonValue) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn with_traits(mut self, traits: Map<String, JsonValue>) -> Self {
        self.attributes
            .insert("traits".to_string(), JsonValue::Object(traits));
        self
    }
}

/// Everything needed to render one send attempt. Built fresh per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub template: EmailTemplate,
    pub recipient: Recipient,
    pub to_address: Option<String>,
    pub from_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedPayload {
    pub to: String,
    pub subject: String,
    pub html: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}
