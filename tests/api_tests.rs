use std::sync::Arc;

use anyhow::Result;
use email_service::{
    api::{AppState, run_api_server},
    clients::{health::HealthChecker, memory::MemoryStore},
    errors::DispatchError,
    services::dispatcher::Mailer,
};
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot};

use crate::support::{RecordingTransport, fast_throttler, throttled_mailer};

async fn serve(mailer: Arc<Mailer>) -> Result<(String, oneshot::Sender<()>)> {
    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(Arc::new(MemoryStore::new()), None, Arc::clone(&mailer)),
        mailer,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(run_api_server(listener, state, async move {
        let _ = shutdown_rx.await;
    }));

    Ok((base_url, shutdown_tx))
}

/// Test: Health reports every component when the throttler is running
#[tokio::test]
async fn test_health_with_throttler() -> Result<()> {
    let mailer = throttled_mailer(Arc::new(RecordingTransport::default()), fast_throttler());
    let (base_url, shutdown) = serve(mailer).await?;

    let response = reqwest::get(format!("{}/health", base_url)).await?;
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await?;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "healthy");
    assert_eq!(body["checks"]["throttler"]["status"], "healthy");

    let _ = shutdown.send(());
    Ok(())
}

/// Test: A missing throttler degrades health and hides metrics
#[tokio::test]
async fn test_without_throttler() -> Result<()> {
    let mailer = Arc::new(Mailer::new(Arc::new(RecordingTransport::default())));
    let (base_url, shutdown) = serve(mailer).await?;

    let health: Value = reqwest::get(format!("{}/health", base_url)).await?.json().await?;
    assert_eq!(health["status"], "degraded");

    let response = reqwest::get(format!("{}/metrics", base_url)).await?;
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await?;
    assert_eq!(body["error"], "Throttler not initialized");

    let _ = shutdown.send(());
    Ok(())
}

/// Test: Metrics expose the dispatch counters
#[tokio::test]
async fn test_metrics_snapshot() -> Result<()> {
    let mailer = throttled_mailer(Arc::new(RecordingTransport::default()), fast_throttler());
    let limiter = mailer.throttler().expect("throttler initialized");
    limiter
        .schedule(|| async { Ok::<_, DispatchError>(()) })
        .await?;

    let (base_url, shutdown) = serve(mailer).await?;
    let body: Value = reqwest::get(format!("{}/metrics", base_url)).await?.json().await?;

    assert_eq!(body["total_sent"], 1);
    assert_eq!(body["total_throttled"], 0);
    assert_eq!(body["total_errored"], 0);
    assert_eq!(body["queued"], 0);

    let _ = shutdown.send(());
    Ok(())
}
