use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    errors::DispatchError,
    models::{
        email::{EmailTemplate, Recipient},
        node_state::CampaignNodeState,
        sent_email::SentEmailRecord,
        status::NodeLifecycle,
    },
};

/// Persistence the dispatch pipeline reads and writes.
///
/// Node-state mutations are conditional single-row updates; the `bool`
/// results report whether the row was in the expected state.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_node_state(&self, id: Uuid) -> Result<Option<CampaignNodeState>, DispatchError>;

    /// PENDING -> RUNNING while the row still holds `expected_attempt`.
    /// Returns `false` when another executor got there first.
    async fn claim_node_state(
        &self,
        id: Uuid,
        expected_attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DispatchError>;

    /// Pushes a PENDING state to `scheduled_run_at` and bumps its attempt
    /// count past `expected_attempt`. Refuses rows that were claimed or
    /// rescheduled since `expected_attempt` was read.
    async fn reschedule_node_state(
        &self,
        id: Uuid,
        expected_attempt: u32,
        scheduled_run_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError>;

    /// RUNNING -> PENDING for a claim whose send never reached the provider.
    /// Same attempt bookkeeping as [`Store::reschedule_node_state`].
    async fn release_node_state(
        &self,
        id: Uuid,
        expected_attempt: u32,
        scheduled_run_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError>;

    /// Moves a non-terminal state to `state` (COMPLETE or ERROR).
    async fn finish_node_state(
        &self,
        id: Uuid,
        state: NodeLifecycle,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError>;

    async fn find_timed_out_node_states(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<CampaignNodeState>, DispatchError>;

    /// RUNNING -> ERROR with `did_timeout` set.
    async fn mark_timed_out(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DispatchError>;

    async fn find_recipient(&self, id: Uuid) -> Result<Option<Recipient>, DispatchError>;

    async fn find_recipient_by_email(&self, email: &str) -> Result<Option<Recipient>, DispatchError>;

    async fn find_template(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Option<EmailTemplate>, DispatchError>;

    async fn count_sent_since(&self, since: DateTime<Utc>) -> Result<u64, DispatchError>;

    async fn insert_sent_email(&self, record: &SentEmailRecord) -> Result<(), DispatchError>;

    async fn health_check(&self) -> Result<(), DispatchError>;
}
