use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{MultiPart, SinglePart, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use tracing::{debug, error, info};

use crate::{
    errors::DispatchError,
    models::email::{ProviderResult, RenderedPayload},
};

pub(crate) const PROVIDER_NAME: &str = "smtp";

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when set, STARTTLS otherwise.
    pub secure: bool,
    pub user: String,
    pub pass: String,
    pub from_address: String,
}

pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
}

impl SmtpProvider {
    pub fn new(settings: SmtpSettings) -> Result<Self, DispatchError> {
        if settings.host.is_empty() {
            return Err(DispatchError::Configuration(
                "SMTP host must be provided".to_string(),
            ));
        }
        if settings.from_address.is_empty() {
            return Err(DispatchError::Configuration(
                "From address must be provided".to_string(),
            ));
        }

        let builder = if settings.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        }
        .map_err(|e| DispatchError::Configuration(format!("Invalid SMTP relay: {}", e)))?;

        let transport = builder
            .port(settings.port)
            .credentials(Credentials::new(settings.user, settings.pass))
            .build();

        info!(host = %settings.host, port = settings.port, "SMTP provider initialized");

        Ok(Self {
            transport,
            from_address: settings.from_address,
        })
    }

    fn build_message(&self, payload: &RenderedPayload) -> Result<Message, DispatchError> {
        let from = payload.from.as_deref().unwrap_or(&self.from_address);

        let builder = Message::builder()
            .from(from.parse().map_err(|e| {
                DispatchError::InvalidPayload(format!("Invalid from address '{}': {}", from, e))
            })?)
            .to(payload.to.parse().map_err(|e| {
                DispatchError::InvalidPayload(format!("Invalid to address '{}': {}", payload.to, e))
            })?)
            .subject(payload.subject.clone());

        let message = match &payload.text {
            Some(text) => builder.multipart(MultiPart::alternative_plain_html(
                text.clone(),
                payload.html.clone(),
            )),
            None => builder.singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(payload.html.clone()),
            ),
        };

        message.map_err(|e| DispatchError::InvalidPayload(e.to_string()))
    }

    pub async fn send(&self, payload: &RenderedPayload) -> Result<ProviderResult, DispatchError> {
        let message = self.build_message(payload)?;

        debug!(to = %payload.to, "Sending email over SMTP");

        let response = self.transport.send(message).await.map_err(|e| {
            error!(error = %e, to = %payload.to, "Could not send email via SMTP");
            DispatchError::provider(PROVIDER_NAME, format!("Could not send email via SMTP: {}", e))
        })?;

        Ok(ProviderResult {
            provider: PROVIDER_NAME.to_string(),
            message_id: response.message().next().map(|line| line.to_string()),
        })
    }
}
