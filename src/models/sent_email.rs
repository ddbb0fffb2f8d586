use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::status::DeliveryStatus;

/// Append-only audit row for a send attempt that reached the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentEmailRecord {
    pub id: Uuid,
    pub email_id: Uuid,
    pub product_user_id: Uuid,
    pub campaign_node_state_id: Option<Uuid>,
    pub attempt: u32,
    pub sent_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub error: Option<String>,
}

impl SentEmailRecord {
    pub fn new(email_id: Uuid, product_user_id: Uuid, delivery_status: DeliveryStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            email_id,
            product_user_id,
            campaign_node_state_id: None,
            attempt: 0,
            sent_at: Utc::now(),
            delivery_status,
            error: None,
        }
    }

    pub fn for_node_state(mut self, node_state_id: Uuid, attempt: u32) -> Self {
        self.campaign_node_state_id = Some(node_state_id);
        self.attempt = attempt;
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}
