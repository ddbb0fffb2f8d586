use thiserror::Error;

/// Failure taxonomy for the dispatch pipeline.
///
/// `Dropped` is recoverable by rescheduling the node state. `NotFound` and
/// `Configuration` are never retried. `Provider` errors are returned to the
/// caller exactly as the provider produced them.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Email dropped by throttler: {0}")]
    Dropped(String),

    #[error("{provider} provider error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Configuration(String),

    #[error("Invalid email payload: {0}")]
    InvalidPayload(String),

    #[error("Coordination store error: {0}")]
    Coordination(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DispatchError {
    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(e: redis::RedisError) -> Self {
        Self::Coordination(e.to_string())
    }
}

impl From<tokio_postgres::Error> for DispatchError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
