use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// Lifecycle of a campaign node state. COMPLETE and ERROR are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeLifecycle {
    Pending,
    Running,
    Complete,
    Error,
}

impl NodeLifecycle {
    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(NodeLifecycle::Pending),
            "RUNNING" => Some(NodeLifecycle::Running),
            "COMPLETE" => Some(NodeLifecycle::Complete),
            "ERROR" => Some(NodeLifecycle::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLifecycle::Pending => "PENDING",
            NodeLifecycle::Running => "RUNNING",
            NodeLifecycle::Complete => "COMPLETE",
            NodeLifecycle::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeLifecycle::Complete | NodeLifecycle::Error)
    }
}

impl Display for NodeLifecycle {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}
