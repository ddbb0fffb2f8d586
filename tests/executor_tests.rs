use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use email_service::{
    clients::{memory::MemoryStore, providers::EmailTransport, store::Store},
    models::{
        execution::ExecutionResult,
        sent_email::SentEmailRecord,
        status::{DeliveryStatus, NodeLifecycle},
        throttler::ThrottlerConfig,
    },
    services::{
        dispatcher::Mailer,
        executor::{EmailNodeExecutor, ExecutorConfig, MAX_RETRIES_EXCEEDED},
    },
};
use uuid::Uuid;

use crate::support::{Campaign, FailingTransport, RecordingTransport, fast_throttler, throttled_mailer};

fn executor(campaign: &Campaign, mailer: Arc<Mailer>) -> EmailNodeExecutor {
    EmailNodeExecutor::new(campaign.store.clone(), mailer, ExecutorConfig::default())
}

fn recording_mailer() -> (Arc<RecordingTransport>, Arc<Mailer>) {
    let transport = Arc::new(RecordingTransport::default());
    let mailer = throttled_mailer(transport.clone() as Arc<dyn EmailTransport>, fast_throttler());
    (transport, mailer)
}

/// Test: Retries exhausted while rate limited ends in an error without touching the state
#[tokio::test]
async fn test_exhausted_retries_return_error() -> Result<()> {
    let campaign = Campaign::seeded(5);
    campaign.fill_last_minute(60).await;
    let (transport, mailer) = recording_mailer();

    let result = executor(&campaign, mailer)
        .execute(&campaign.node, &campaign.state)
        .await;

    assert_eq!(result, ExecutionResult::error(MAX_RETRIES_EXCEEDED));
    assert_eq!(campaign.stored_state(), campaign.state, "State must not be mutated");
    assert!(transport.sent().is_empty());

    Ok(())
}

/// Test: A rate-limited attempt is rescheduled one minute out
#[tokio::test]
async fn test_rate_limited_attempt_is_rescheduled() -> Result<()> {
    let campaign = Campaign::seeded(2);
    campaign.fill_last_minute(60).await;
    let (transport, mailer) = recording_mailer();

    let before = Utc::now();
    let result = executor(&campaign, mailer)
        .execute(&campaign.node, &campaign.state)
        .await;

    let ExecutionResult::Reschedule { run_at } = result else {
        panic!("Expected reschedule, got {:?}", result);
    };
    assert!(run_at >= before + TimeDelta::seconds(60));

    let stored = campaign.stored_state();
    assert_eq!(stored.attempt_count, 3);
    assert_eq!(stored.scheduled_run_at, run_at);
    assert_eq!(stored.state, NodeLifecycle::Pending);
    assert!(transport.sent().is_empty());

    Ok(())
}

/// Test: The last send of the day goes out and is recorded
#[tokio::test]
async fn test_send_under_daily_cap_succeeds() -> Result<()> {
    let campaign = Campaign::seeded(0);
    let (transport, mailer) = recording_mailer();
    let executor = executor(&campaign, mailer.clone());
    executor.daily_counter().resume(249);

    let result = executor.execute(&campaign.node, &campaign.state).await;

    let ExecutionResult::Continue { payload } = result else {
        panic!("Expected continue, got {:?}", result);
    };
    assert_eq!(payload.to, "test@example.com");
    assert_eq!(payload.html, "<p>Hello Test User</p>");
    assert_eq!(executor.daily_counter().count(), 250);

    let records = campaign.store.sent_emails();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].delivery_status, DeliveryStatus::Sent);
    assert_eq!(records[0].campaign_node_state_id, Some(campaign.state.id));
    assert_eq!(records[0].email_id, campaign.template.id);

    assert_eq!(transport.sent().len(), 1);
    assert_eq!(mailer.metrics()?.total_sent, 1);
    assert_eq!(campaign.stored_state().state, NodeLifecycle::Running);

    Ok(())
}

/// Test: Reaching the daily cap defers the send
#[tokio::test]
async fn test_daily_cap_defers_send() -> Result<()> {
    let campaign = Campaign::seeded(0);
    let (transport, mailer) = recording_mailer();
    let executor = executor(&campaign, mailer);
    executor.daily_counter().resume(250);

    let result = executor.execute(&campaign.node, &campaign.state).await;

    assert!(matches!(result, ExecutionResult::Reschedule { .. }));
    assert_eq!(campaign.stored_state().attempt_count, 1);
    assert!(transport.sent().is_empty());

    Ok(())
}

/// Test: Missing recipient and template are non-retryable errors
#[tokio::test]
async fn test_missing_records_are_errors() -> Result<()> {
    let campaign = Campaign::seeded(0);
    let (_, mailer) = recording_mailer();
    let executor = executor(&campaign, mailer);

    let mut orphan = campaign.state.clone();
    orphan.product_user_id = Uuid::new_v4();
    assert_eq!(
        executor.execute(&campaign.node, &orphan).await,
        ExecutionResult::error("recipient not found")
    );

    let mut foreign = campaign.state.clone();
    foreign.user_id = Uuid::new_v4();
    assert_eq!(
        executor.execute(&campaign.node, &foreign).await,
        ExecutionResult::error("template not found")
    );

    assert_eq!(campaign.stored_state().state, NodeLifecycle::Pending);

    Ok(())
}

/// Test: Only one of two concurrent executors sends
#[tokio::test]
async fn test_claim_prevents_double_send() -> Result<()> {
    let campaign = Campaign::seeded(0);
    let (transport, mailer) = recording_mailer();
    let executor = Arc::new(executor(&campaign, mailer));

    let first = {
        let executor = Arc::clone(&executor);
        let node = campaign.node.clone();
        let state = campaign.state.clone();
        tokio::spawn(async move { executor.execute(&node, &state).await })
    };
    let second = {
        let executor = Arc::clone(&executor);
        let node = campaign.node.clone();
        let state = campaign.state.clone();
        tokio::spawn(async move { executor.execute(&node, &state).await })
    };

    let results = [first.await?, second.await?];

    let sent = results
        .iter()
        .filter(|r| matches!(r, ExecutionResult::Continue { .. }))
        .count();
    let stopped = results
        .iter()
        .filter(|r| matches!(r, ExecutionResult::Stop))
        .count();

    assert_eq!((sent, stopped), (1, 1));
    assert_eq!(transport.sent().len(), 1);

    Ok(())
}

/// Test: Terminal states are left alone
#[tokio::test]
async fn test_terminal_state_stops() -> Result<()> {
    let campaign = Campaign::seeded(0);
    let (transport, mailer) = recording_mailer();

    let mut done = campaign.state.clone();
    done.state = NodeLifecycle::Complete;

    let result = executor(&campaign, mailer).execute(&campaign.node, &done).await;

    assert_eq!(result, ExecutionResult::Stop);
    assert!(transport.sent().is_empty());

    Ok(())
}

/// Test: A provider failure is recorded and fails the node
#[tokio::test]
async fn test_provider_failure_is_recorded() -> Result<()> {
    let campaign = Campaign::seeded(1);
    let mailer = throttled_mailer(Arc::new(FailingTransport), fast_throttler());
    let executor = executor(&campaign, mailer.clone());

    let result = executor.run(&campaign.node, &campaign.state).await;

    let ExecutionResult::Error { reason } = result else {
        panic!("Expected error, got {:?}", result);
    };
    assert!(reason.contains("401"));

    let records = campaign.store.sent_emails();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].delivery_status, DeliveryStatus::Failed);
    assert_eq!(records[0].attempt, 1);
    assert!(records[0].error.as_deref().is_some_and(|e| e.contains("401")));

    let stored = campaign.stored_state();
    assert_eq!(stored.state, NodeLifecycle::Error);
    assert!(!stored.did_timeout);
    assert_eq!(executor.daily_counter().count(), 0);
    assert_eq!(mailer.metrics()?.total_errored, 1);

    Ok(())
}

/// Test: A successful run completes the node state
#[tokio::test]
async fn test_run_completes_node_state() -> Result<()> {
    let campaign = Campaign::seeded(0);
    let (_, mailer) = recording_mailer();

    let result = executor(&campaign, mailer)
        .run(&campaign.node, &campaign.state)
        .await;

    assert!(matches!(result, ExecutionResult::Continue { .. }));
    let stored = campaign.stored_state();
    assert_eq!(stored.state, NodeLifecycle::Complete);
    assert!(stored.completed_at.is_some());

    Ok(())
}

/// Test: A throttler drop releases the claim and reschedules
#[tokio::test]
async fn test_throttler_drop_reschedules() -> Result<()> {
    let campaign = Campaign::seeded(0);
    let transport = Arc::new(RecordingTransport::default());
    let mailer = throttled_mailer(
        transport.clone(),
        ThrottlerConfig {
            reservoir: 0,
            reservoir_refresh_interval_ms: 0,
            ..fast_throttler()
        },
    );

    let result = executor(&campaign, mailer.clone())
        .execute(&campaign.node, &campaign.state)
        .await;

    assert!(matches!(result, ExecutionResult::Reschedule { .. }));
    let stored = campaign.stored_state();
    assert_eq!(stored.state, NodeLifecycle::Pending);
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.started_at.is_none());

    assert!(transport.sent().is_empty());
    assert!(campaign.store.sent_emails().is_empty());
    assert_eq!(mailer.metrics()?.total_throttled, 1);

    Ok(())
}

/// Test: Without a throttler the executor refuses to send by default
#[tokio::test]
async fn test_missing_throttler_fails_node() -> Result<()> {
    let campaign = Campaign::seeded(0);
    let transport = Arc::new(RecordingTransport::default());
    let mailer = Arc::new(Mailer::new(transport.clone()));

    let result = executor(&campaign, mailer)
        .execute(&campaign.node, &campaign.state)
        .await;

    assert_eq!(result, ExecutionResult::error("Email throttler not initialized"));
    assert!(transport.sent().is_empty());
    assert!(campaign.store.sent_emails().is_empty());

    Ok(())
}

/// Test: The daily counter resumes from today's records
#[tokio::test]
async fn test_daily_count_resumes_from_records() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    for _ in 0..3 {
        let record = SentEmailRecord::new(Uuid::new_v4(), Uuid::new_v4(), DeliveryStatus::Sent);
        store.insert_sent_email(&record).await?;
    }

    let mut stale = SentEmailRecord::new(Uuid::new_v4(), Uuid::new_v4(), DeliveryStatus::Sent);
    stale.sent_at = Utc::now() - TimeDelta::days(2);
    store.insert_sent_email(&stale).await?;

    let executor = EmailNodeExecutor::new(
        store,
        Arc::new(Mailer::new(Arc::new(RecordingTransport::default()))),
        ExecutorConfig::default(),
    );

    assert_eq!(executor.resume_daily_count().await?, 3);
    assert_eq!(executor.daily_counter().count(), 3);

    Ok(())
}

/// Test: A stale pending copy cannot undo another executor's claim
#[tokio::test]
async fn test_stale_copy_does_not_reopen_claimed_state() -> Result<()> {
    let campaign = Campaign::seeded(2);
    assert!(
        campaign
            .store
            .claim_node_state(campaign.state.id, 2, Utc::now())
            .await?
    );
    campaign.fill_last_minute(60).await;
    let (transport, mailer) = recording_mailer();

    let result = executor(&campaign, mailer)
        .execute(&campaign.node, &campaign.state)
        .await;

    assert_eq!(result, ExecutionResult::Stop);
    let stored = campaign.stored_state();
    assert_eq!(stored.state, NodeLifecycle::Running);
    assert_eq!(stored.attempt_count, 2);
    assert!(stored.started_at.is_some());
    assert!(transport.sent().is_empty());

    Ok(())
}

/// Test: A copy read before a reschedule cannot claim the next attempt early
#[tokio::test]
async fn test_stale_copy_cannot_claim_rescheduled_state() -> Result<()> {
    let campaign = Campaign::seeded(1);
    let run_at = Utc::now() + TimeDelta::minutes(1);
    assert!(
        campaign
            .store
            .reschedule_node_state(campaign.state.id, 1, run_at)
            .await?
    );
    let (transport, mailer) = recording_mailer();

    let result = executor(&campaign, mailer)
        .execute(&campaign.node, &campaign.state)
        .await;

    assert_eq!(result, ExecutionResult::Stop);
    let stored = campaign.stored_state();
    assert_eq!(stored.state, NodeLifecycle::Pending);
    assert_eq!(stored.attempt_count, 2);
    assert_eq!(stored.scheduled_run_at, run_at);
    assert!(transport.sent().is_empty());

    Ok(())
}

/// Test: A drop after the claim with retries exhausted fails the node
#[tokio::test]
async fn test_drop_with_exhausted_retries_fails_node() -> Result<()> {
    let campaign = Campaign::seeded(5);
    let transport = Arc::new(RecordingTransport::default());
    let mailer = throttled_mailer(
        transport.clone(),
        ThrottlerConfig {
            reservoir: 0,
            reservoir_refresh_interval_ms: 0,
            ..fast_throttler()
        },
    );

    let result = executor(&campaign, mailer.clone())
        .run(&campaign.node, &campaign.state)
        .await;

    assert_eq!(result, ExecutionResult::error(MAX_RETRIES_EXCEEDED));

    let stored = campaign.stored_state();
    assert_eq!(stored.state, NodeLifecycle::Error);
    assert!(!stored.did_timeout);
    assert!(stored.completed_at.is_some());
    assert_eq!(stored.attempt_count, 5);

    assert!(transport.sent().is_empty());
    assert!(campaign.store.sent_emails().is_empty());
    assert_eq!(mailer.metrics()?.total_throttled, 1);

    Ok(())
}
