use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        providers::EmailTransport,
        rate_limiter::{LimiterBackend, RateLimiter},
        store::Store,
    },
    errors::DispatchError,
    models::{
        email::{EmailTemplate, ProviderResult, Recipient, RenderedPayload, SendRequest},
        metrics::DispatchMetricsSnapshot,
        throttler::ThrottlerConfig,
    },
};

/// How a send interacts with the shared throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleMode {
    /// Go through the throttler when one is initialized, otherwise send directly.
    #[default]
    Preferred,
    /// Refuse to send without a throttler.
    Required,
    /// Always send directly. Used for manual test sends.
    Bypass,
}

/// Owns the provider transport and the process-wide throttler.
///
/// Built once in `main` and shared by every consumer.
pub struct Mailer {
    transport: Arc<dyn EmailTransport>,
    throttler: RwLock<Option<Arc<RateLimiter>>>,
}

impl Mailer {
    pub fn new(transport: Arc<dyn EmailTransport>) -> Self {
        Self {
            transport,
            throttler: RwLock::new(None),
        }
    }

    pub fn transport(&self) -> Arc<dyn EmailTransport> {
        Arc::clone(&self.transport)
    }

    /// Creates the throttler on first call. Later calls return the existing
    /// one and ignore their arguments.
    pub fn initialize_throttler(
        &self,
        config: ThrottlerConfig,
        backend: Arc<dyn LimiterBackend>,
    ) -> Arc<RateLimiter> {
        let mut slot = self.throttler.write();
        if let Some(existing) = slot.as_ref() {
            warn!("Email throttler already initialized, keeping existing instance");
            return Arc::clone(existing);
        }

        let limiter = Arc::new(RateLimiter::new(config, backend));
        *slot = Some(Arc::clone(&limiter));
        limiter
    }

    pub fn throttler(&self) -> Option<Arc<RateLimiter>> {
        self.throttler.read().clone()
    }

    pub fn metrics(&self) -> Result<DispatchMetricsSnapshot, DispatchError> {
        self.throttler()
            .map(|limiter| limiter.metrics())
            .ok_or_else(|| DispatchError::Configuration("Throttler not initialized".to_string()))
    }

    /// Stops and forgets the throttler. A later `initialize_throttler` call
    /// creates a fresh one.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        let limiter = self.throttler.write().take();
        match limiter {
            Some(limiter) => limiter.stop().await,
            None => Ok(()),
        }
    }

    /// Hands a rendered payload to the provider, through the throttler when
    /// `mode` asks for it.
    pub async fn dispatch(
        &self,
        transport: &dyn EmailTransport,
        payload: &RenderedPayload,
        mode: ThrottleMode,
    ) -> Result<ProviderResult, DispatchError> {
        let throttler = match mode {
            ThrottleMode::Bypass => None,
            ThrottleMode::Preferred => self.throttler(),
            ThrottleMode::Required => Some(self.throttler().ok_or_else(|| {
                DispatchError::Configuration("Email throttler not initialized".to_string())
            })?),
        };

        info!(to = %payload.to, throttled = throttler.is_some(), "Sending email");

        let result = match throttler {
            Some(limiter) => limiter.schedule(|| transport.send(payload)).await,
            None => transport.send(payload).await,
        };

        match &result {
            Ok(sent) => info!(
                to = %payload.to,
                provider = %sent.provider,
                message_id = ?sent.message_id,
                "Email sent successfully"
            ),
            Err(e) => error!(to = %payload.to, error = %e, "An error occurred sending the email"),
        }

        result
    }

    /// Sends a stored template to an arbitrary address, bypassing the
    /// throttler. Unknown addresses get a placeholder recipient.
    pub async fn send_test_email(
        &self,
        store: &dyn Store,
        request: TestEmailRequest,
    ) -> Result<ProviderResult, DispatchError> {
        let mut template = store
            .find_template(request.owner_id, request.email_id)
            .await?
            .ok_or(DispatchError::NotFound("email"))?;

        if let Some(subject) = request.subject.filter(|s| !s.is_empty()) {
            template.subject = subject;
        }
        if let Some(body_html) = request.body_html.filter(|b| !b.is_empty()) {
            template.body_html = body_html;
        }

        let recipient = match store.find_recipient_by_email(&request.to).await? {
            Some(recipient) => recipient,
            None => placeholder_recipient(&request.to),
        };

        let delivery = SendEmail::new(template, recipient)
            .to_address(request.to)
            .throttle_mode(ThrottleMode::Bypass)
            .send(self)
            .await?;

        Ok(delivery.result)
    }
}

/// Input for [`Mailer::send_test_email`].
#[derive(Debug, Clone, Deserialize)]
pub struct TestEmailRequest {
    pub owner_id: Uuid,
    pub email_id: Uuid,
    pub to: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
}

fn placeholder_recipient(address: &str) -> Recipient {
    Recipient::new(Uuid::nil(), Some(address.to_string()))
        .with_attribute("firstName", json!("Test"))
        .with_attribute("lastName", json!("User"))
        .with_attribute("domain", json!("example.com"))
}

/// The outcome of a successful [`SendEmail::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub payload: RenderedPayload,
    pub result: ProviderResult,
}

/// One email to one recipient, configured builder style.
pub struct SendEmail {
    request: SendRequest,
    transport: Option<Arc<dyn EmailTransport>>,
    mode: ThrottleMode,
}

impl SendEmail {
    pub fn new(template: EmailTemplate, recipient: Recipient) -> Self {
        Self {
            request: SendRequest {
                template,
                recipient,
                to_address: None,
                from_address: None,
            },
            transport: None,
            mode: ThrottleMode::default(),
        }
    }

    pub fn to_address(mut self, address: impl Into<String>) -> Self {
        self.request.to_address = Some(address.into());
        self
    }

    pub fn from_address(mut self, address: impl Into<String>) -> Self {
        self.request.from_address = Some(address.into());
        self
    }

    /// Overrides the mailer's transport for this send.
    pub fn transport(mut self, transport: Arc<dyn EmailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn throttle_mode(mut self, mode: ThrottleMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn get_payload(&self) -> Result<RenderedPayload, DispatchError> {
        self.request.render()
    }

    pub async fn send(&self, mailer: &Mailer) -> Result<Delivery, DispatchError> {
        let payload = self.get_payload()?;
        let transport = self
            .transport
            .clone()
            .unwrap_or_else(|| mailer.transport());

        let result = mailer
            .dispatch(transport.as_ref(), &payload, self.mode)
            .await?;

        Ok(Delivery { payload, result })
    }
}
