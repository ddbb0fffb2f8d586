use std::sync::Arc;

use async_trait::async_trait;
use email_service::{
    clients::{
        alert::AlertSink, memory::MemoryStore, providers::EmailTransport,
        rate_limiter::MemoryLimiterBackend, store::Store,
    },
    errors::DispatchError,
    models::{
        email::{EmailTemplate, ProviderResult, Recipient, RenderedPayload},
        node_state::{CampaignNodeState, EmailCampaignNode},
        sent_email::SentEmailRecord,
        status::DeliveryStatus,
        throttler::ThrottlerConfig,
    },
    services::dispatcher::Mailer,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::{Duration, Instant, sleep};
use uuid::Uuid;

/// Transport that records every payload and the instant it was handed over.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<RenderedPayload>>,
    pub started: Mutex<Vec<Instant>>,
    pub hold: Option<Duration>,
}

impl RecordingTransport {
    pub fn holding(hold: Duration) -> Self {
        Self {
            hold: Some(hold),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<RenderedPayload> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(&self, payload: &RenderedPayload) -> Result<ProviderResult, DispatchError> {
        self.started.lock().push(Instant::now());
        if let Some(hold) = self.hold {
            sleep(hold).await;
        }
        self.sent.lock().push(payload.clone());

        Ok(ProviderResult {
            provider: "recording".to_string(),
            message_id: Some(format!("msg-{}", self.sent.lock().len())),
        })
    }
}

/// Transport whose every send fails the way a rejecting provider would.
pub struct FailingTransport;

#[async_trait]
impl EmailTransport for FailingTransport {
    async fn send(&self, _payload: &RenderedPayload) -> Result<ProviderResult, DispatchError> {
        Err(DispatchError::provider("sendgrid", "SendGrid returned status 401: bad key"))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub alerts: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn titles(&self) -> Vec<String> {
        self.alerts.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl AlertSink for RecordingSink {
    fn send_alert(&self, title: &str, message: &str) {
        self.alerts.lock().push((title.to_string(), message.to_string()));
    }
}

/// Limits loose enough that only the behaviour under test is constrained.
pub fn fast_throttler() -> ThrottlerConfig {
    ThrottlerConfig {
        max_concurrent: 10,
        min_time_ms: 0,
        reservoir: 1000,
        reservoir_refresh_amount: 1000,
        reservoir_refresh_interval_ms: 60_000,
        max_wait_ms: 1_000,
        lease_ttl_ms: 60_000,
        drain_timeout_ms: 1_000,
    }
}

pub fn throttled_mailer(transport: Arc<dyn EmailTransport>, config: ThrottlerConfig) -> Arc<Mailer> {
    let mailer = Arc::new(Mailer::new(transport));
    mailer.initialize_throttler(config, Arc::new(MemoryLimiterBackend::new()));
    mailer
}

pub fn hello_template(owner_id: Uuid) -> EmailTemplate {
    EmailTemplate {
        id: Uuid::new_v4(),
        user_id: owner_id,
        subject: "Welcome {{name}}".to_string(),
        body_html: "<p>Hello {{name}}</p>".to_string(),
        body_text: None,
        from_address: None,
    }
}

pub fn test_user() -> Recipient {
    Recipient::new(Uuid::new_v4(), Some("test@example.com".to_string()))
        .with_attribute("name", json!("Test User"))
        .with_attribute("email", json!("test@example.com"))
}

/// A store seeded with one template, one recipient and a pending node state
/// pointing at both.
pub struct Campaign {
    pub store: Arc<MemoryStore>,
    pub node: EmailCampaignNode,
    pub state: CampaignNodeState,
    pub template: EmailTemplate,
    pub recipient: Recipient,
}

impl Campaign {
    pub fn seeded(attempt_count: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        let owner_id = Uuid::new_v4();
        let template = hello_template(owner_id);
        let recipient = test_user();

        let node = EmailCampaignNode {
            id: Uuid::new_v4(),
            email_id: template.id,
        };
        let state = CampaignNodeState::pending(node.id, recipient.id, owner_id)
            .with_attempt_count(attempt_count);

        store.insert_template(template.clone());
        store.insert_recipient(recipient.clone());
        store.insert_node_state(state.clone());

        Self {
            store,
            node,
            state,
            template,
            recipient,
        }
    }

    pub fn stored_state(&self) -> CampaignNodeState {
        self.store
            .node_state(self.state.id)
            .expect("seeded node state")
    }

    /// Writes `count` SENT records stamped now, filling the trailing minute.
    pub async fn fill_last_minute(&self, count: usize) {
        for _ in 0..count {
            let record = SentEmailRecord::new(
                self.template.id,
                self.recipient.id,
                DeliveryStatus::Sent,
            );
            self.store.insert_sent_email(&record).await.unwrap();
        }
    }
}
