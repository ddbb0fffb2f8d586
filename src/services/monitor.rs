use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{Duration, Instant, interval_at},
};
use tracing::{info, warn};

use crate::{
    clients::alert::AlertSink,
    models::monitoring::{Alert, MonitoringConfig},
    services::dispatcher::Mailer,
};

/// Periodically samples dispatch metrics and raises alerts when rates cross
/// their thresholds.
pub struct EmailMonitor {
    mailer: Arc<Mailer>,
    sink: Arc<dyn AlertSink>,
    config: MonitoringConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EmailMonitor {
    pub fn new(mailer: Arc<Mailer>, sink: Arc<dyn AlertSink>, config: MonitoringConfig) -> Self {
        Self {
            mailer,
            sink,
            config,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Starts the check timer. The first check runs one interval after start.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Email monitoring already started");
            return;
        }

        let period = Duration::from_millis(self.config.check_interval_ms.max(1));
        let monitor = Arc::clone(self);

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                monitor.check_metrics();
            }
        }));

        info!(
            check_interval_ms = self.config.check_interval_ms,
            "Started monitoring email metrics"
        );
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("Stopped monitoring email metrics");
        }
    }

    /// Runs one check and returns the alerts it raised.
    pub fn check_metrics(&self) -> Vec<Alert> {
        let metrics = match self.mailer.metrics() {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(error = %e, "No email metrics available");
                return Vec::new();
            }
        };

        let thresholds = &self.config.alert_thresholds;
        let error_rate = metrics.error_rate();
        let drop_rate = metrics.drop_rate();
        let mut alerts = Vec::new();

        if error_rate > thresholds.error_rate {
            alerts.push(Alert {
                title: "High Error Rate".to_string(),
                message: format!(
                    "Email error rate is {:.2}%, above threshold of {}%",
                    error_rate, thresholds.error_rate
                ),
            });
        }

        if drop_rate > thresholds.drop_rate {
            alerts.push(Alert {
                title: "High Drop Rate".to_string(),
                message: format!(
                    "Email drop rate is {:.2}%, above threshold of {}%",
                    drop_rate, thresholds.drop_rate
                ),
            });
        }

        if metrics.queued > thresholds.queue_size {
            alerts.push(Alert {
                title: "Email Queue Backlog".to_string(),
                message: format!(
                    "{} emails are waiting for a send slot, above threshold of {}",
                    metrics.queued, thresholds.queue_size
                ),
            });
        }

        info!(
            total_sent = metrics.total_sent,
            total_errored = metrics.total_errored,
            total_throttled = metrics.total_throttled,
            queued = metrics.queued,
            "Current email metrics"
        );

        for alert in &alerts {
            self.sink.send_alert(&alert.title, &alert.message);
        }

        alerts
    }
}

impl Drop for EmailMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
