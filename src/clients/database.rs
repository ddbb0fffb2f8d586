use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    clients::store::Store,
    errors::DispatchError,
    models::{
        email::{EmailTemplate, Recipient},
        node_state::CampaignNodeState,
        retry::RetryConfig,
        sent_email::SentEmailRecord,
        status::{DeliveryStatus, NodeLifecycle},
    },
    utils::retry_with_backoff,
};

const NODE_STATE_COLUMNS: &str = "id, campaign_node_id, product_user_id, user_id, state, \
     scheduled_run_at, attempt_count, started_at, completed_at, did_timeout";

pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, retry_config: &RetryConfig) -> Result<Self, DispatchError> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = retry_with_backoff(retry_config, || async {
            tokio_postgres::connect(database_url, NoTls).await
        })
        .await
        .map_err(|e| DispatchError::Storage(format!("Failed to connect to database: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self { client })
    }

    async fn requeue(
        &self,
        id: Uuid,
        from: NodeLifecycle,
        expected_attempt: u32,
        scheduled_run_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let expected_attempt = as_db_count(expected_attempt);
        let updated = self
            .client
            .execute(
                "UPDATE campaign_node_states \
                 SET state = 'PENDING', attempt_count = attempt_count + 1, \
                     scheduled_run_at = $4, started_at = NULL \
                 WHERE id = $1 AND state = $2 AND attempt_count = $3",
                &[&id, &from.as_str(), &expected_attempt, &scheduled_run_at],
            )
            .await?;

        debug!(node_state_id = %id, from = %from, requeued = updated == 1, "Node state requeue attempted");
        Ok(updated == 1)
    }
}

fn node_state_from_row(row: &Row) -> Result<CampaignNodeState, DispatchError> {
    let state: String = row.try_get("state")?;
    let attempt_count: i32 = row.try_get("attempt_count")?;

    Ok(CampaignNodeState {
        id: row.try_get("id")?,
        campaign_node_id: row.try_get("campaign_node_id")?,
        product_user_id: row.try_get("product_user_id")?,
        user_id: row.try_get("user_id")?,
        state: NodeLifecycle::from_string(&state)
            .ok_or_else(|| DispatchError::Storage(format!("Unknown node state: {}", state)))?,
        scheduled_run_at: row.try_get("scheduled_run_at")?,
        attempt_count: u32::try_from(attempt_count).unwrap_or_default(),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        did_timeout: row.try_get("did_timeout")?,
    })
}

fn recipient_from_row(row: &Row) -> Result<Recipient, DispatchError> {
    let attributes = match row.try_get::<_, Option<JsonValue>>("attributes")? {
        Some(JsonValue::Object(map)) => map,
        _ => Default::default(),
    };

    Ok(Recipient {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        attributes,
    })
}

fn as_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl Store for PostgresStore {
    async fn find_node_state(&self, id: Uuid) -> Result<Option<CampaignNodeState>, DispatchError> {
        let query = format!(
            "SELECT {} FROM campaign_node_states WHERE id = $1",
            NODE_STATE_COLUMNS
        );
        self.client
            .query_opt(query.as_str(), &[&id])
            .await?
            .as_ref()
            .map(node_state_from_row)
            .transpose()
    }

    async fn claim_node_state(
        &self,
        id: Uuid,
        expected_attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let expected_attempt = as_db_count(expected_attempt);
        let updated = self
            .client
            .execute(
                "UPDATE campaign_node_states \
                 SET state = 'RUNNING', started_at = $3 \
                 WHERE id = $1 AND state = 'PENDING' AND attempt_count = $2",
                &[&id, &expected_attempt, &now],
            )
            .await?;

        debug!(node_state_id = %id, claimed = updated == 1, "Node state claim attempted");
        Ok(updated == 1)
    }

    async fn reschedule_node_state(
        &self,
        id: Uuid,
        expected_attempt: u32,
        scheduled_run_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        self.requeue(id, NodeLifecycle::Pending, expected_attempt, scheduled_run_at)
            .await
    }

    async fn release_node_state(
        &self,
        id: Uuid,
        expected_attempt: u32,
        scheduled_run_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        self.requeue(id, NodeLifecycle::Running, expected_attempt, scheduled_run_at)
            .await
    }

    async fn finish_node_state(
        &self,
        id: Uuid,
        state: NodeLifecycle,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let updated = self
            .client
            .execute(
                "UPDATE campaign_node_states \
                 SET state = $2, completed_at = $3 \
                 WHERE id = $1 AND state IN ('PENDING', 'RUNNING')",
                &[&id, &state.as_str(), &completed_at],
            )
            .await?;

        Ok(updated == 1)
    }

    async fn find_timed_out_node_states(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<CampaignNodeState>, DispatchError> {
        let query = format!(
            "SELECT {} FROM campaign_node_states \
             WHERE state = 'RUNNING' AND started_at < $1",
            NODE_STATE_COLUMNS
        );
        self.client
            .query(query.as_str(), &[&started_before])
            .await?
            .iter()
            .map(node_state_from_row)
            .collect()
    }

    async fn mark_timed_out(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DispatchError> {
        let updated = self
            .client
            .execute(
                "UPDATE campaign_node_states \
                 SET state = 'ERROR', did_timeout = TRUE, completed_at = $2 \
                 WHERE id = $1 AND state = 'RUNNING'",
                &[&id, &now],
            )
            .await?;

        Ok(updated == 1)
    }

    async fn find_recipient(&self, id: Uuid) -> Result<Option<Recipient>, DispatchError> {
        self.client
            .query_opt(
                "SELECT id, email, attributes FROM product_users WHERE id = $1",
                &[&id],
            )
            .await?
            .as_ref()
            .map(recipient_from_row)
            .transpose()
    }

    async fn find_recipient_by_email(&self, email: &str) -> Result<Option<Recipient>, DispatchError> {
        self.client
            .query_opt(
                "SELECT id, email, attributes FROM product_users WHERE email = $1 LIMIT 1",
                &[&email],
            )
            .await?
            .as_ref()
            .map(recipient_from_row)
            .transpose()
    }

    async fn find_template(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Option<EmailTemplate>, DispatchError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, user_id, subject, body_html, body_text, from_address \
                 FROM emails WHERE id = $1 AND user_id = $2",
                &[&id, &user_id],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(EmailTemplate {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            subject: row.try_get("subject")?,
            body_html: row.try_get("body_html")?,
            body_text: row.try_get("body_text")?,
            from_address: row.try_get("from_address")?,
        }))
    }

    async fn count_sent_since(&self, since: DateTime<Utc>) -> Result<u64, DispatchError> {
        let row = self
            .client
            .query_one(
                "SELECT COUNT(*) AS sent FROM sent_emails WHERE sent_at >= $1",
                &[&since],
            )
            .await?;

        let sent: i64 = row.try_get("sent")?;
        Ok(sent.max(0) as u64)
    }

    async fn insert_sent_email(&self, record: &SentEmailRecord) -> Result<(), DispatchError> {
        let attempt = as_db_count(record.attempt);
        let (delivered_at, errored_at) = match record.delivery_status {
            DeliveryStatus::Sent => (Some(record.sent_at), None),
            DeliveryStatus::Failed => (None, Some(record.sent_at)),
        };

        self.client
            .execute(
                "INSERT INTO sent_emails (\
                    id, email_id, product_user_id, campaign_node_state_id, attempt, \
                    sent_at, delivery_status, delivered_at, errored_at, error\
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &record.id,
                    &record.email_id,
                    &record.product_user_id,
                    &record.campaign_node_state_id,
                    &attempt,
                    &record.sent_at,
                    &record.delivery_status.as_str(),
                    &delivered_at,
                    &errored_at,
                    &record.error,
                ],
            )
            .await
            .map_err(|e| {
                error!(
                    error = %e,
                    sent_email_id = %record.id,
                    "Failed to write sent email record"
                );
                DispatchError::from(e)
            })?;

        debug!(
            sent_email_id = %record.id,
            delivery_status = %record.delivery_status,
            "Sent email record written"
        );

        Ok(())
    }

    async fn health_check(&self) -> Result<(), DispatchError> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| DispatchError::Storage(format!("Database health check failed: {}", e)))?;

        Ok(())
    }
}
