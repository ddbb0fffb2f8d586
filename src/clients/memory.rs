use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    clients::store::Store,
    errors::DispatchError,
    models::{
        email::{EmailTemplate, Recipient},
        node_state::CampaignNodeState,
        sent_email::SentEmailRecord,
        status::NodeLifecycle,
    },
};

#[derive(Default)]
struct Tables {
    node_states: HashMap<Uuid, CampaignNodeState>,
    recipients: HashMap<Uuid, Recipient>,
    templates: HashMap<Uuid, EmailTemplate>,
    sent_emails: Vec<SentEmailRecord>,
}

/// Store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node_state(&self, state: CampaignNodeState) {
        self.tables.lock().node_states.insert(state.id, state);
    }

    pub fn insert_recipient(&self, recipient: Recipient) {
        self.tables.lock().recipients.insert(recipient.id, recipient);
    }

    pub fn insert_template(&self, template: EmailTemplate) {
        self.tables.lock().templates.insert(template.id, template);
    }

    pub fn node_state(&self, id: Uuid) -> Option<CampaignNodeState> {
        self.tables.lock().node_states.get(&id).cloned()
    }

    pub fn sent_emails(&self) -> Vec<SentEmailRecord> {
        self.tables.lock().sent_emails.clone()
    }

    fn requeue(
        &self,
        id: Uuid,
        from: NodeLifecycle,
        expected_attempt: u32,
        scheduled_run_at: DateTime<Utc>,
    ) -> bool {
        let mut tables = self.tables.lock();
        match tables.node_states.get_mut(&id) {
            Some(state) if state.state == from && state.attempt_count == expected_attempt => {
                state.state = NodeLifecycle::Pending;
                state.attempt_count = expected_attempt + 1;
                state.scheduled_run_at = scheduled_run_at;
                state.started_at = None;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_node_state(&self, id: Uuid) -> Result<Option<CampaignNodeState>, DispatchError> {
        Ok(self.node_state(id))
    }

    async fn claim_node_state(
        &self,
        id: Uuid,
        expected_attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let mut tables = self.tables.lock();
        match tables.node_states.get_mut(&id) {
            Some(state)
                if state.state == NodeLifecycle::Pending
                    && state.attempt_count == expected_attempt =>
            {
                state.state = NodeLifecycle::Running;
                state.started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule_node_state(
        &self,
        id: Uuid,
        expected_attempt: u32,
        scheduled_run_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        Ok(self.requeue(id, NodeLifecycle::Pending, expected_attempt, scheduled_run_at))
    }

    async fn release_node_state(
        &self,
        id: Uuid,
        expected_attempt: u32,
        scheduled_run_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        Ok(self.requeue(id, NodeLifecycle::Running, expected_attempt, scheduled_run_at))
    }

    async fn finish_node_state(
        &self,
        id: Uuid,
        lifecycle: NodeLifecycle,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let mut tables = self.tables.lock();
        match tables.node_states.get_mut(&id) {
            Some(state) if !state.state.is_terminal() => {
                state.state = lifecycle;
                state.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_timed_out_node_states(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<CampaignNodeState>, DispatchError> {
        Ok(self
            .tables
            .lock()
            .node_states
            .values()
            .filter(|s| {
                s.state == NodeLifecycle::Running
                    && s.started_at.is_some_and(|started| started < started_before)
            })
            .cloned()
            .collect())
    }

    async fn mark_timed_out(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DispatchError> {
        let mut tables = self.tables.lock();
        match tables.node_states.get_mut(&id) {
            Some(state) if state.state == NodeLifecycle::Running => {
                state.state = NodeLifecycle::Error;
                state.did_timeout = true;
                state.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_recipient(&self, id: Uuid) -> Result<Option<Recipient>, DispatchError> {
        Ok(self.tables.lock().recipients.get(&id).cloned())
    }

    async fn find_recipient_by_email(&self, email: &str) -> Result<Option<Recipient>, DispatchError> {
        Ok(self
            .tables
            .lock()
            .recipients
            .values()
            .find(|r| r.email.as_deref() == Some(email))
            .cloned())
    }

    async fn find_template(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Option<EmailTemplate>, DispatchError> {
        Ok(self
            .tables
            .lock()
            .templates
            .get(&id)
            .filter(|t| t.user_id == user_id)
            .cloned())
    }

    async fn count_sent_since(&self, since: DateTime<Utc>) -> Result<u64, DispatchError> {
        Ok(self
            .tables
            .lock()
            .sent_emails
            .iter()
            .filter(|r| r.sent_at >= since)
            .count() as u64)
    }

    async fn insert_sent_email(&self, record: &SentEmailRecord) -> Result<(), DispatchError> {
        self.tables.lock().sent_emails.push(record.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}
