use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::email::RenderedPayload;

/// Outcome of one executor attempt, consumed by the campaign graph evaluator.
///
/// `Reschedule` asks the caller to re-enqueue the node state no earlier than
/// `run_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionResult {
    Continue { payload: RenderedPayload },
    Stop,
    Error { reason: String },
    Reschedule { run_at: DateTime<Utc> },
}

impl ExecutionResult {
    pub fn error(reason: impl Into<String>) -> Self {
        ExecutionResult::Error {
            reason: reason.into(),
        }
    }
}
