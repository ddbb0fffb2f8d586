use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::{
    errors::DispatchError,
    models::email::{ProviderResult, RenderedPayload},
};

pub(crate) const PROVIDER_NAME: &str = "mailgun";

#[derive(Debug, Clone)]
pub struct MailgunSettings {
    pub api_key: String,
    pub domain: String,
    pub base_url: String,
    pub from_address: String,
}

#[derive(Debug, Deserialize)]
struct MailgunResponse {
    id: Option<String>,
}

pub struct MailgunProvider {
    http_client: Client,
    settings: MailgunSettings,
}

impl MailgunProvider {
    pub fn new(settings: MailgunSettings) -> Result<Self, DispatchError> {
        if settings.domain.is_empty() {
            return Err(DispatchError::Configuration(
                "Mailgun domain must be provided".to_string(),
            ));
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| DispatchError::Configuration("Failed to create HTTP client".to_string()))?;

        info!(domain = %settings.domain, "Mailgun provider initialized");

        Ok(Self {
            http_client,
            settings,
        })
    }

    pub async fn send(&self, payload: &RenderedPayload) -> Result<ProviderResult, DispatchError> {
        let from = payload.from.as_deref().unwrap_or(&self.settings.from_address);

        let mut form = vec![
            ("from", from),
            ("to", payload.to.as_str()),
            ("subject", payload.subject.as_str()),
            ("html", payload.html.as_str()),
        ];
        if let Some(text) = &payload.text {
            form.push(("text", text.as_str()));
        }

        let url = format!(
            "{}/v3/{}/messages",
            self.settings.base_url, self.settings.domain
        );
        debug!(to = %payload.to, "Sending email through Mailgun");

        let response = self
            .http_client
            .post(&url)
            .basic_auth("api", Some(&self.settings.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|e| DispatchError::provider(PROVIDER_NAME, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: MailgunResponse = response.json().await.map_err(|e| {
                DispatchError::provider(PROVIDER_NAME, format!("Unreadable response: {}", e))
            })?;

            Ok(ProviderResult {
                provider: PROVIDER_NAME.to_string(),
                message_id: body.id,
            })
        } else {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = %status, error = %error_text, "Mailgun request failed");
            Err(DispatchError::provider(
                PROVIDER_NAME,
                format!("Mailgun returned status {}: {}", status, error_text),
            ))
        }
    }
}
