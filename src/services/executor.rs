use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{
    clients::store::Store,
    errors::DispatchError,
    models::{
        execution::ExecutionResult,
        node_state::{CampaignNodeState, EmailCampaignNode},
        sent_email::SentEmailRecord,
        status::{DeliveryStatus, NodeLifecycle},
    },
    services::dispatcher::{Mailer, SendEmail, ThrottleMode},
};

pub const MAX_RETRIES_EXCEEDED: &str = "max retry attempts exceeded";

const MIN_RESCHEDULE_DELAY: TimeDelta = TimeDelta::seconds(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Sends allowed per UTC calendar day by this process.
    pub max_per_day: u64,
    /// Sends recorded in the trailing minute before new sends are deferred.
    pub max_per_minute: u64,
    pub max_retries: u32,
    pub reschedule_delay: Duration,
    /// Refuse to send when the shared throttler is missing.
    pub require_throttler: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_per_day: 250,
            max_per_minute: 60,
            max_retries: 5,
            reschedule_delay: Duration::from_secs(60),
            require_throttler: true,
        }
    }
}

/// Process-local count of sends for the current UTC day.
#[derive(Debug)]
pub struct DailySendCounter {
    state: Mutex<(NaiveDate, u64)>,
}

impl Default for DailySendCounter {
    fn default() -> Self {
        Self {
            state: Mutex::new((Utc::now().date_naive(), 0)),
        }
    }
}

impl DailySendCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces today's count, e.g. with the number of records already
    /// written before a restart.
    pub fn resume(&self, count: u64) {
        *self.state.lock() = (Utc::now().date_naive(), count);
    }

    pub fn count(&self) -> u64 {
        self.count_at(Utc::now())
    }

    pub fn count_at(&self, now: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock();
        Self::roll(&mut state, now.date_naive());
        state.1
    }

    pub fn increment_at(&self, now: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock();
        Self::roll(&mut state, now.date_naive());
        state.1 += 1;
        state.1
    }

    fn roll(state: &mut (NaiveDate, u64), today: NaiveDate) {
        if state.0 != today {
            debug!(previous_day = %state.0, sent = state.1, "Resetting daily send counter");
            *state = (today, 0);
        }
    }
}

/// Whether this executor holds the RUNNING claim on the node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Unclaimed,
    Held,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eligibility {
    Eligible,
    DailyCapReached,
    MinuteCapReached,
}

/// Executes email nodes of a campaign for one recipient at a time.
pub struct EmailNodeExecutor {
    store: Arc<dyn Store>,
    mailer: Arc<Mailer>,
    config: ExecutorConfig,
    daily: DailySendCounter,
}

impl EmailNodeExecutor {
    pub fn new(store: Arc<dyn Store>, mailer: Arc<Mailer>, config: ExecutorConfig) -> Self {
        Self {
            store,
            mailer,
            config,
            daily: DailySendCounter::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn daily_counter(&self) -> &DailySendCounter {
        &self.daily
    }

    /// Seeds the daily counter from records written earlier today.
    pub async fn resume_daily_count(&self) -> Result<u64, DispatchError> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or_else(Utc::now);

        let count = self.store.count_sent_since(midnight).await?;
        self.daily.resume(count);
        info!(sent_today = count, "Daily send counter resumed");
        Ok(count)
    }

    async fn check_eligibility(&self, now: DateTime<Utc>) -> Result<Eligibility, DispatchError> {
        if self.daily.count_at(now) >= self.config.max_per_day {
            return Ok(Eligibility::DailyCapReached);
        }

        let last_minute = self.store.count_sent_since(now - TimeDelta::minutes(1)).await?;
        if last_minute >= self.config.max_per_minute {
            return Ok(Eligibility::MinuteCapReached);
        }

        Ok(Eligibility::Eligible)
    }

    /// Runs one attempt for `state`. Never fails: every outcome is encoded in
    /// the returned [`ExecutionResult`].
    pub async fn execute(
        &self,
        node: &EmailCampaignNode,
        state: &CampaignNodeState,
    ) -> ExecutionResult {
        info!(
            node_state_id = %state.id,
            product_user_id = %state.product_user_id,
            email_id = %node.email_id,
            attempt = state.attempt_count,
            "Starting email node execution"
        );

        if state.state.is_terminal() {
            debug!(node_state_id = %state.id, state = %state.state, "Node state already terminal");
            return ExecutionResult::Stop;
        }

        let now = Utc::now();
        match self.check_eligibility(now).await {
            Ok(Eligibility::Eligible) => {}
            Ok(reason) => {
                info!(node_state_id = %state.id, ?reason, "Send not eligible yet");
                return self.retry_later(state, Claim::Unclaimed, now).await;
            }
            Err(e) => {
                error!(node_state_id = %state.id, error = %e, "Eligibility check failed");
                return ExecutionResult::error(e.to_string());
            }
        }

        let recipient = match self.store.find_recipient(state.product_user_id).await {
            Ok(Some(recipient)) => recipient,
            Ok(None) => {
                error!(product_user_id = %state.product_user_id, "Could not find recipient");
                return ExecutionResult::error("recipient not found");
            }
            Err(e) => return ExecutionResult::error(e.to_string()),
        };

        let template = match self.store.find_template(state.user_id, node.email_id).await {
            Ok(Some(template)) => template,
            Ok(None) => {
                error!(email_id = %node.email_id, user_id = %state.user_id, "Could not find email template");
                return ExecutionResult::error("template not found");
            }
            Err(e) => return ExecutionResult::error(e.to_string()),
        };

        match self
            .store
            .claim_node_state(state.id, state.attempt_count, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(node_state_id = %state.id, "Node state claimed elsewhere, skipping");
                return ExecutionResult::Stop;
            }
            Err(e) => return ExecutionResult::error(e.to_string()),
        }

        let mode = if self.config.require_throttler {
            ThrottleMode::Required
        } else {
            ThrottleMode::Preferred
        };

        let send = SendEmail::new(template, recipient).throttle_mode(mode);

        match send.send(&self.mailer).await {
            Ok(delivery) => {
                let sent_today = self.daily.increment_at(Utc::now());
                let record =
                    SentEmailRecord::new(node.email_id, state.product_user_id, DeliveryStatus::Sent)
                        .for_node_state(state.id, state.attempt_count);
                self.record(&record).await;

                info!(
                    node_state_id = %state.id,
                    to = %delivery.payload.to,
                    sent_today,
                    "Email node execution completed"
                );
                ExecutionResult::Continue {
                    payload: delivery.payload,
                }
            }
            Err(e) if e.is_dropped() => {
                warn!(node_state_id = %state.id, error = %e, "Send dropped by throttler");
                self.retry_later(state, Claim::Held, Utc::now()).await
            }
            Err(e) => {
                error!(
                    node_state_id = %state.id,
                    email_id = %node.email_id,
                    error = %e,
                    "Error sending email"
                );

                if matches!(e, DispatchError::Provider { .. }) {
                    let record = SentEmailRecord::new(
                        node.email_id,
                        state.product_user_id,
                        DeliveryStatus::Failed,
                    )
                    .for_node_state(state.id, state.attempt_count)
                    .with_error(e.to_string());
                    self.record(&record).await;
                }

                ExecutionResult::error(e.to_string())
            }
        }
    }

    /// Executes and persists terminal outcomes.
    pub async fn run(&self, node: &EmailCampaignNode, state: &CampaignNodeState) -> ExecutionResult {
        let result = self.execute(node, state).await;

        let terminal = match &result {
            ExecutionResult::Continue { .. } => Some(NodeLifecycle::Complete),
            ExecutionResult::Error { .. } => Some(NodeLifecycle::Error),
            ExecutionResult::Stop | ExecutionResult::Reschedule { .. } => None,
        };

        if let Some(lifecycle) = terminal {
            match self.store.finish_node_state(state.id, lifecycle, Utc::now()).await {
                Ok(true) => debug!(node_state_id = %state.id, state = %lifecycle, "Node state finished"),
                Ok(false) => warn!(node_state_id = %state.id, "Node state already terminal"),
                Err(e) => error!(node_state_id = %state.id, error = %e, "Failed to persist node state"),
            }
        }

        result
    }

    /// Earliest time the next attempt may run. Always strictly after both
    /// `now` and the current schedule.
    fn next_run_at(&self, state: &CampaignNodeState, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.config.reschedule_delay)
            .unwrap_or(TimeDelta::minutes(1))
            .max(MIN_RESCHEDULE_DELAY);

        let run_at = now + delay;
        if run_at <= state.scheduled_run_at {
            state.scheduled_run_at + delay
        } else {
            run_at
        }
    }

    async fn retry_later(
        &self,
        state: &CampaignNodeState,
        claim: Claim,
        now: DateTime<Utc>,
    ) -> ExecutionResult {
        if state.attempt_count >= self.config.max_retries {
            warn!(
                node_state_id = %state.id,
                attempts = state.attempt_count,
                "Giving up on node state"
            );
            return ExecutionResult::error(MAX_RETRIES_EXCEEDED);
        }

        let run_at = self.next_run_at(state, now);
        let attempt_count = state.attempt_count + 1;

        let updated = match claim {
            Claim::Unclaimed => {
                self.store
                    .reschedule_node_state(state.id, state.attempt_count, run_at)
                    .await
            }
            Claim::Held => {
                self.store
                    .release_node_state(state.id, state.attempt_count, run_at)
                    .await
            }
        };

        match updated {
            Ok(true) => {
                info!(node_state_id = %state.id, attempt_count, %run_at, "Node state rescheduled");
                ExecutionResult::Reschedule { run_at }
            }
            Ok(false) => {
                warn!(node_state_id = %state.id, "Node state changed before reschedule");
                ExecutionResult::Stop
            }
            Err(e) => {
                error!(node_state_id = %state.id, error = %e, "Failed to reschedule node state");
                ExecutionResult::error(e.to_string())
            }
        }
    }

    async fn record(&self, record: &SentEmailRecord) {
        if let Err(e) = self.store.insert_sent_email(record).await {
            error!(sent_email_id = %record.id, error = %e, "Failed to record sent email");
        }
    }
}
