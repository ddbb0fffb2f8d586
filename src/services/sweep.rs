use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{Duration, MissedTickBehavior, interval},
};
use tracing::{error, info};

use crate::{clients::store::Store, errors::DispatchError};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// How long a node state may stay RUNNING.
    pub deadline: Duration,
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(3600),
            interval: Duration::from_secs(60),
        }
    }
}

/// Forces node states stuck in RUNNING past the deadline to ERROR.
pub struct TimeoutSweep {
    store: Arc<dyn Store>,
    config: SweepConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutSweep {
    pub fn new(store: Arc<dyn Store>, config: SweepConfig) -> Self {
        Self {
            store,
            config,
            task: Mutex::new(None),
        }
    }

    /// One pass. Returns how many node states were timed out. A state that
    /// fails to update is logged and left for the next pass.
    pub async fn tick(&self) -> Result<usize, DispatchError> {
        info!("Starting timeout check");

        let now = Utc::now();
        let deadline = TimeDelta::from_std(self.config.deadline)
            .map_err(|e| DispatchError::Configuration(format!("Invalid sweep deadline: {}", e)))?;

        let stale = self
            .store
            .find_timed_out_node_states(now - deadline)
            .await?;

        let mut timed_out = 0;
        let mut failed = 0;
        for state in &stale {
            match self.store.mark_timed_out(state.id, now).await {
                Ok(true) => {
                    timed_out += 1;
                    info!(node_state_id = %state.id, "Node state marked as timed out");
                }
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    error!(node_state_id = %state.id, error = %e, "Failed to time out node state");
                }
            }
        }

        info!(processed = timed_out, failed, "Completed timeout check");
        Ok(timed_out)
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let sweep = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(sweep.config.interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = sweep.tick().await {
                    error!(error = %e, "Error processing timeouts");
                }
            }
        }));

        info!(
            interval_secs = self.config.interval.as_secs(),
            deadline_secs = self.config.deadline.as_secs(),
            "Timeout sweep started"
        );
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("Timeout sweep stopped");
        }
    }
}

impl Drop for TimeoutSweep {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
