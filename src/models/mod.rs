pub mod email;
pub mod execution;
pub mod health;
pub mod metrics;
pub mod monitoring;
pub mod node_state;
pub mod retry;
pub mod sent_email;
pub mod status;
pub mod throttler;
