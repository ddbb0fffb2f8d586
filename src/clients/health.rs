use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{redis::RedisClient, store::Store},
    models::health::{ComponentHealth, HealthCheckResponse, HealthStatus},
    services::dispatcher::Mailer,
};

pub struct HealthChecker {
    store: Arc<dyn Store>,
    redis: Option<RedisClient>,
    mailer: Arc<Mailer>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn Store>, redis: Option<RedisClient>, mailer: Arc<Mailer>) -> Self {
        Self {
            store,
            redis,
            mailer,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("database".to_string(), self.check_database().await);
        if let Some(redis) = &self.redis {
            checks.insert("coordination_store".to_string(), Self::check_redis(redis).await);
        }
        checks.insert("throttler".to_string(), self.check_throttler().await);

        HealthCheckResponse {
            status: Self::determine_overall_status(&checks),
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_database(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.store.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ComponentHealth::unhealthy(e.to_string())
            }
        }
    }

    async fn check_redis(redis: &RedisClient) -> ComponentHealth {
        let start = Instant::now();

        match redis.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Redis health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Redis ping failed");
                ComponentHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    async fn check_throttler(&self) -> ComponentHealth {
        let Some(limiter) = self.mailer.throttler() else {
            return ComponentHealth::degraded("Throttler not initialized");
        };

        if limiter.is_stopped() {
            return ComponentHealth::unhealthy("Throttler stopped".to_string());
        }

        let start = Instant::now();
        match limiter.reservoir_level().await {
            Ok(0) => ComponentHealth::degraded("Reservoir exhausted"),
            Ok(level) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(reservoir = level, "Throttler health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Throttler health check failed");
                ComponentHealth::unhealthy(e.to_string())
            }
        }
    }

    fn determine_overall_status(checks: &HashMap<String, ComponentHealth>) -> HealthStatus {
        if checks
            .values()
            .any(|health| health.status == HealthStatus::Unhealthy)
        {
            HealthStatus::Unhealthy
        } else if checks
            .values()
            .any(|health| health.status == HealthStatus::Degraded)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
