pub mod mailgun;
pub mod sendgrid;
pub mod smtp;

use async_trait::async_trait;

use crate::{
    errors::DispatchError,
    models::email::{ProviderResult, RenderedPayload},
};

pub use mailgun::{MailgunProvider, MailgunSettings};
pub use sendgrid::{SendGridProvider, SendGridSettings};
pub use smtp::{SmtpProvider, SmtpSettings};

/// The single capability every email provider offers.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, payload: &RenderedPayload) -> Result<ProviderResult, DispatchError>;
}

#[derive(Debug, Clone)]
pub enum ProviderSettings {
    Smtp(SmtpSettings),
    SendGrid(SendGridSettings),
    Mailgun(MailgunSettings),
}

/// The configured provider, chosen once at startup.
pub enum EmailProvider {
    Smtp(SmtpProvider),
    SendGrid(SendGridProvider),
    Mailgun(MailgunProvider),
}

impl EmailProvider {
    pub fn from_settings(settings: ProviderSettings) -> Result<Self, DispatchError> {
        let provider = match settings {
            ProviderSettings::Smtp(settings) => EmailProvider::Smtp(SmtpProvider::new(settings)?),
            ProviderSettings::SendGrid(settings) => {
                EmailProvider::SendGrid(SendGridProvider::new(settings)?)
            }
            ProviderSettings::Mailgun(settings) => {
                EmailProvider::Mailgun(MailgunProvider::new(settings)?)
            }
        };
        Ok(provider)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EmailProvider::Smtp(_) => smtp::PROVIDER_NAME,
            EmailProvider::SendGrid(_) => sendgrid::PROVIDER_NAME,
            EmailProvider::Mailgun(_) => mailgun::PROVIDER_NAME,
        }
    }
}

#[async_trait]
impl EmailTransport for EmailProvider {
    async fn send(&self, payload: &RenderedPayload) -> Result<ProviderResult, DispatchError> {
        match self {
            EmailProvider::Smtp(provider) => provider.send(payload).await,
            EmailProvider::SendGrid(provider) => provider.send(payload).await,
            EmailProvider::Mailgun(provider) => provider.send(payload).await,
        }
    }
}
