use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Percentage of errored sends that triggers an alert.
    pub error_rate: f64,
    /// Number of queued sends that triggers an alert.
    pub queue_size: u64,
    /// Percentage of dropped sends that triggers an alert.
    pub drop_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 5.0,
            queue_size: 100,
            drop_rate: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub alert_thresholds: AlertThresholds,
    pub check_interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            alert_thresholds: AlertThresholds::default(),
            check_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
}
