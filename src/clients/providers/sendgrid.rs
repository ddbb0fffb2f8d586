use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::{
    errors::DispatchError,
    models::email::{ProviderResult, RenderedPayload},
};

pub(crate) const PROVIDER_NAME: &str = "sendgrid";

#[derive(Debug, Clone)]
pub struct SendGridSettings {
    pub api_key: String,
    pub base_url: String,
    pub from_address: String,
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct MailSendRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
}

pub struct SendGridProvider {
    http_client: Client,
    settings: SendGridSettings,
}

impl SendGridProvider {
    pub fn new(settings: SendGridSettings) -> Result<Self, DispatchError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| DispatchError::Configuration("Failed to create HTTP client".to_string()))?;

        info!(base_url = %settings.base_url, "SendGrid provider initialized");

        Ok(Self {
            http_client,
            settings,
        })
    }

    pub async fn send(&self, payload: &RenderedPayload) -> Result<ProviderResult, DispatchError> {
        let mut content = Vec::with_capacity(2);
        if let Some(text) = &payload.text {
            content.push(Content {
                content_type: "text/plain",
                value: text,
            });
        }
        content.push(Content {
            content_type: "text/html",
            value: &payload.html,
        });

        let request = MailSendRequest {
            personalizations: vec![Personalization {
                to: vec![Address { email: &payload.to }],
            }],
            from: Address {
                email: payload.from.as_deref().unwrap_or(&self.settings.from_address),
            },
            subject: &payload.subject,
            content,
        };

        let url = format!("{}/v3/mail/send", self.settings.base_url);
        debug!(to = %payload.to, "Sending email through SendGrid");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| DispatchError::provider(PROVIDER_NAME, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .headers()
                .get("x-message-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            Ok(ProviderResult {
                provider: PROVIDER_NAME.to_string(),
                message_id,
            })
        } else {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = %status, error = %error_text, "SendGrid request failed");
            Err(DispatchError::provider(
                PROVIDER_NAME,
                format!("SendGrid returned status {}: {}", status, error_text),
            ))
        }
    }
}
