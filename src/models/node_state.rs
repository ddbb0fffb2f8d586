use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::status::NodeLifecycle;

/// The email node of a campaign graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailCampaignNode {
    pub id: Uuid,
    pub email_id: Uuid,
}

/// A recipient's progress marker at one campaign node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignNodeState {
    pub id: Uuid,
    pub campaign_node_id: Uuid,
    pub product_user_id: Uuid,
    pub user_id: Uuid,
    pub state: NodeLifecycle,
    pub scheduled_run_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub did_timeout: bool,
}

impl CampaignNodeState {
    pub fn pending(campaign_node_id: Uuid, product_user_id: Uuid, user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_node_id,
            product_user_id,
            user_id,
            state: NodeLifecycle::Pending,
            scheduled_run_at: Utc::now(),
            attempt_count: 0,
            started_at: None,
            completed_at: None,
            did_timeout: false,
        }
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }
}
