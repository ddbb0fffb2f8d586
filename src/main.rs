use std::sync::Arc;

use anyhow::{Error, Result};
use email_service::{
    api::{AppState, run_api_server},
    clients::{
        alert::{AlertSink, LogAlertSink, WebhookAlertSink},
        database::PostgresStore,
        health::HealthChecker,
        providers::EmailProvider,
        redis::{RedisClient, RedisLimiterBackend},
        store::Store,
    },
    config::Config,
    services::{
        dispatcher::Mailer, executor::EmailNodeExecutor, monitor::EmailMonitor,
        sweep::TimeoutSweep,
    },
    utils::init_tracing,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = Config::load()?;
    let retry_config = config.retry_config();

    let store: Arc<dyn Store> =
        Arc::new(PostgresStore::connect(&config.database_url, &retry_config).await?);
    let redis = RedisClient::connect(&config.redis_url, &retry_config).await?;

    let provider = EmailProvider::from_settings(config.provider_settings()?)?;
    info!(provider = provider.name(), "Email provider configured");

    let mailer = Arc::new(Mailer::new(Arc::new(provider)));
    mailer.initialize_throttler(
        config.throttler_config(),
        Arc::new(RedisLimiterBackend::new(&config.throttler_name, &redis)),
    );

    // Shared with the campaign runner that drives node execution.
    let executor = Arc::new(EmailNodeExecutor::new(
        Arc::clone(&store),
        Arc::clone(&mailer),
        config.executor_config(),
    ));
    if let Err(e) = executor.resume_daily_count().await {
        warn!(error = %e, "Could not resume daily send counter, starting from zero");
    }

    let sink: Arc<dyn AlertSink> = match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(url.clone())),
        None => Arc::new(LogAlertSink),
    };
    let monitor = Arc::new(EmailMonitor::new(
        Arc::clone(&mailer),
        sink,
        config.monitoring_config(),
    ));
    monitor.start();

    let sweep = Arc::new(TimeoutSweep::new(Arc::clone(&store), config.sweep_config()));
    sweep.start();

    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(Arc::clone(&store), Some(redis), Arc::clone(&mailer)),
        mailer: Arc::clone(&mailer),
    });
    let listener = TcpListener::bind(("0.0.0.0", config.server_port)).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    };

    if let Err(e) = run_api_server(listener, state, shutdown).await {
        error!(error = %e, "Operational API server failed");
    }

    monitor.stop();
    sweep.stop();
    mailer.stop().await?;

    info!("Email service stopped");
    Ok(())
}
