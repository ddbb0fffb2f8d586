use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error, warn};

/// Destination for monitor alerts. Delivery is fire-and-forget: a sink never
/// blocks or fails the caller.
pub trait AlertSink: Send + Sync {
    fn send_alert(&self, title: &str, message: &str);
}

/// Writes alerts to the error log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send_alert(&self, title: &str, message: &str) {
        error!(alert = title, "{}", message);
    }
}

/// Posts alerts as JSON to an HTTP endpoint.
#[derive(Clone)]
pub struct WebhookAlertSink {
    url: String,
    client: Client,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            url: url.into(),
            client,
        }
    }

    pub async fn deliver(&self, title: &str, message: &str) -> Result<(), reqwest::Error> {
        let payload = json!({
            "title": title,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });

        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        debug!(alert = title, "Alert delivered to webhook");
        Ok(())
    }
}

impl AlertSink for WebhookAlertSink {
    fn send_alert(&self, title: &str, message: &str) {
        error!(alert = title, "{}", message);

        let sink = self.clone();
        let title = title.to_string();
        let message = message.to_string();

        tokio::spawn(async move {
            if let Err(e) = sink.deliver(&title, &message).await {
                warn!(error = %e, alert = %title, "Failed to deliver alert to webhook");
            }
        });
    }
}
