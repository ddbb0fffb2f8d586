use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{Duration, Instant, sleep, timeout},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    errors::DispatchError,
    models::{
        metrics::{DispatchMetrics, DispatchMetricsSnapshot},
        throttler::ThrottlerConfig,
    },
};

/// Poll interval while every concurrency slot is taken.
pub(crate) const SLOT_POLL_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// A slot and a reservoir token were taken; the send may start at `start_at_ms`.
    Granted { start_at_ms: u64 },
    /// Nothing is available yet; ask again after `retry_after_ms`.
    Wait { retry_after_ms: u64 },
}

/// Shared state behind the throttler. Every call must be atomic with respect
/// to every other instance using the same backend.
#[async_trait]
pub trait LimiterBackend: Send + Sync {
    async fn reserve(
        &self,
        config: &ThrottlerConfig,
        lease_id: &str,
        now_ms: u64,
    ) -> Result<Reservation, DispatchError>;

    async fn release(&self, lease_id: &str) -> Result<(), DispatchError>;

    async fn reservoir_level(
        &self,
        config: &ThrottlerConfig,
        now_ms: u64,
    ) -> Result<u32, DispatchError>;

    async fn disconnect(&self) -> Result<(), DispatchError>;
}

/// Token bucket plus concurrency leases, the same algorithm the Redis script
/// runs server side.
#[derive(Debug, Default)]
struct BucketState {
    reservoir: Option<u32>,
    last_refill_ms: Option<u64>,
    next_start_ms: u64,
    leases: HashMap<String, u64>,
}

impl BucketState {
    fn refill(&mut self, config: &ThrottlerConfig, now_ms: u64) -> u32 {
        let size = config.reservoir;
        let interval = config.reservoir_refresh_interval_ms;
        let last = *self.last_refill_ms.get_or_insert(now_ms);
        let mut level = self.reservoir.unwrap_or(size).min(size);

        if interval > 0 && now_ms >= last + interval {
            let intervals = (now_ms - last) / interval;
            let added = intervals.saturating_mul(u64::from(config.reservoir_refresh_amount));
            level = u64::from(level).saturating_add(added).min(u64::from(size)) as u32;
            self.last_refill_ms = Some(last + intervals * interval);
        }

        self.reservoir = Some(level);
        level
    }

    fn reserve(&mut self, config: &ThrottlerConfig, lease_id: &str, now_ms: u64) -> Reservation {
        let level = self.refill(config, now_ms);
        self.leases.retain(|_, expires_at| *expires_at > now_ms);

        if self.leases.len() as u64 >= u64::from(config.max_concurrent) {
            return Reservation::Wait {
                retry_after_ms: SLOT_POLL_MS,
            };
        }

        if level == 0 {
            let retry_after_ms = match config.reservoir_refresh_interval_ms {
                0 => u64::MAX,
                interval => {
                    let last = self.last_refill_ms.unwrap_or(now_ms);
                    (last + interval).saturating_sub(now_ms).max(1)
                }
            };
            return Reservation::Wait { retry_after_ms };
        }

        let start_at_ms = now_ms.max(self.next_start_ms);
        self.reservoir = Some(level - 1);
        self.next_start_ms = start_at_ms + config.min_time_ms;
        self.leases
            .insert(lease_id.to_string(), start_at_ms + config.lease_ttl_ms);

        Reservation::Granted { start_at_ms }
    }
}

/// In-process backend for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryLimiterBackend {
    state: Mutex<BucketState>,
    closed: AtomicBool,
}

impl MemoryLimiterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Coordination(
                "Limiter backend is disconnected".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LimiterBackend for MemoryLimiterBackend {
    async fn reserve(
        &self,
        config: &ThrottlerConfig,
        lease_id: &str,
        now_ms: u64,
    ) -> Result<Reservation, DispatchError> {
        self.ensure_open()?;
        Ok(self.state.lock().reserve(config, lease_id, now_ms))
    }

    async fn release(&self, lease_id: &str) -> Result<(), DispatchError> {
        self.state.lock().leases.remove(lease_id);
        Ok(())
    }

    async fn reservoir_level(
        &self,
        config: &ThrottlerConfig,
        now_ms: u64,
    ) -> Result<u32, DispatchError> {
        Ok(self.state.lock().refill(config, now_ms))
    }

    async fn disconnect(&self) -> Result<(), DispatchError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Wall-clock milliseconds derived from tokio's monotonic clock, so instances
/// agree on time and paused-time tests stay deterministic.
#[derive(Debug)]
struct LimiterClock {
    epoch_ms: u64,
    origin: Instant,
}

impl LimiterClock {
    fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            epoch_ms,
            origin: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as u64
    }
}

/// Shared email throttler. Every provider call made through [`RateLimiter::schedule`]
/// respects the concurrency, spacing and reservoir limits of its
/// [`ThrottlerConfig`] across all instances sharing the backend.
pub struct RateLimiter {
    config: ThrottlerConfig,
    backend: Arc<dyn LimiterBackend>,
    metrics: DispatchMetrics,
    clock: LimiterClock,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard<'a> {
    limiter: &'a RateLimiter,
}

impl<'a> InFlightGuard<'a> {
    fn enter(limiter: &'a RateLimiter) -> Self {
        limiter.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { limiter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.limiter.idle.notify_waiters();
        }
    }
}

impl RateLimiter {
    pub fn new(config: ThrottlerConfig, backend: Arc<dyn LimiterBackend>) -> Self {
        info!(
            max_concurrent = config.max_concurrent,
            min_time_ms = config.min_time_ms,
            reservoir = config.reservoir,
            reservoir_refresh_amount = config.reservoir_refresh_amount,
            reservoir_refresh_interval_ms = config.reservoir_refresh_interval_ms,
            "Email throttler initialized"
        );

        Self {
            config,
            backend,
            metrics: DispatchMetrics::default(),
            clock: LimiterClock::new(),
            stopped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn reservoir_level(&self) -> Result<u32, DispatchError> {
        self.backend
            .reservoir_level(&self.config, self.clock.now_ms())
            .await
    }

    /// Runs `task` once a slot is available. The task's own error is returned
    /// unchanged; a task that never gets a slot fails with
    /// [`DispatchError::Dropped`].
    pub async fn schedule<F, Fut, T>(&self, task: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        if self.is_stopped() {
            return Err(DispatchError::Configuration(
                "Email throttler has been stopped".to_string(),
            ));
        }

        let _guard = InFlightGuard::enter(self);
        let lease_id = Uuid::new_v4().to_string();

        if let Err(e) = self.wait_for_slot(&lease_id).await {
            if e.is_dropped() {
                warn!(error = %e, "Email dropped by throttler");
                self.metrics.record_throttled();
            } else {
                error!(error = %e, "Email throttler failed to reserve a slot");
                self.metrics.record_errored();
            }
            return Err(e);
        }

        let result = task().await;

        if let Err(e) = self.backend.release(&lease_id).await {
            warn!(error = %e, lease_id = %lease_id, "Failed to release throttler slot");
        }

        match &result {
            Ok(_) => self.metrics.record_sent(),
            Err(e) => {
                error!(error = %e, "Throttled task failed");
                self.metrics.record_errored();
            }
        }

        result
    }

    async fn wait_for_slot(&self, lease_id: &str) -> Result<(), DispatchError> {
        let queued = self.metrics.enter_queue();
        let reserved = self.reserve_slot(lease_id).await;
        drop(queued);

        let start_at_ms = reserved?;
        let now_ms = self.clock.now_ms();
        if start_at_ms > now_ms {
            sleep(Duration::from_millis(start_at_ms - now_ms)).await;
        }

        Ok(())
    }

    async fn reserve_slot(&self, lease_id: &str) -> Result<u64, DispatchError> {
        let deadline_ms = self.clock.now_ms().saturating_add(self.config.max_wait_ms);

        loop {
            if self.is_stopped() {
                return Err(DispatchError::Dropped(
                    "throttler stopped before a slot was available".to_string(),
                ));
            }

            let now_ms = self.clock.now_ms();
            match self.backend.reserve(&self.config, lease_id, now_ms).await? {
                Reservation::Granted { start_at_ms } => return Ok(start_at_ms),
                Reservation::Wait { retry_after_ms } => {
                    if now_ms.saturating_add(retry_after_ms) > deadline_ms {
                        return Err(DispatchError::Dropped(format!(
                            "no send slot available within {}ms",
                            self.config.max_wait_ms
                        )));
                    }

                    debug!(retry_after_ms, "Throttler saturated, waiting for a slot");
                    sleep(Duration::from_millis(retry_after_ms)).await;
                }
            }
        }
    }

    /// Stops accepting work, waits up to `drain_timeout_ms` for in-flight
    /// sends, then releases the backend. Safe to call more than once.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Stopping email throttler");

        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };

        let drain_timeout = Duration::from_millis(self.config.drain_timeout_ms);
        if timeout(drain_timeout, drained).await.is_err() {
            warn!(
                abandoned = self.in_flight.load(Ordering::SeqCst),
                "Abandoning in-flight sends"
            );
        }

        self.backend.disconnect().await?;
        info!("Email throttler stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(reservoir: u32, refresh_amount: u32, interval: u64) -> ThrottlerConfig {
        ThrottlerConfig {
            max_concurrent: 10,
            min_time_ms: 0,
            reservoir,
            reservoir_refresh_amount: refresh_amount,
            reservoir_refresh_interval_ms: interval,
            ..ThrottlerConfig::default()
        }
    }

    #[test]
    fn test_reservoir_starts_full_and_drains() {
        let config = config(3, 3, 1000);
        let mut state = BucketState::default();

        for i in 0..3 {
            let granted = state.reserve(&config, &format!("lease-{i}"), 0);
            assert!(matches!(granted, Reservation::Granted { .. }));
            state.leases.clear();
        }

        assert_eq!(
            state.reserve(&config, "lease-x", 10),
            Reservation::Wait {
                retry_after_ms: 990
            }
        );
    }

    #[test]
    fn test_refill_is_clamped_to_capacity() {
        let config = config(5, 4, 100);
        let mut state = BucketState::default();

        state.refill(&config, 0);
        state.reservoir = Some(3);

        // Ten intervals would add 40 tokens.
        assert_eq!(state.refill(&config, 1000), 5);
        assert_eq!(state.last_refill_ms, Some(1000));
    }

    #[test]
    fn test_partial_interval_does_not_refill() {
        let config = config(5, 5, 100);
        let mut state = BucketState::default();

        state.refill(&config, 0);
        state.reservoir = Some(1);

        assert_eq!(state.refill(&config, 99), 1);
        assert_eq!(state.refill(&config, 150), 5);
        assert_eq!(state.last_refill_ms, Some(100));
    }

    #[test]
    fn test_concurrency_slots_are_bounded() {
        let mut config = config(100, 100, 1000);
        config.max_concurrent = 2;
        let mut state = BucketState::default();

        assert!(matches!(
            state.reserve(&config, "a", 0),
            Reservation::Granted { .. }
        ));
        assert!(matches!(
            state.reserve(&config, "b", 0),
            Reservation::Granted { .. }
        ));
        assert_eq!(
            state.reserve(&config, "c", 0),
            Reservation::Wait {
                retry_after_ms: SLOT_POLL_MS
            }
        );

        state.leases.remove("a");
        assert!(matches!(
            state.reserve(&config, "c", 0),
            Reservation::Granted { .. }
        ));
    }

    #[test]
    fn test_expired_leases_free_their_slot() {
        let mut config = config(100, 100, 1000);
        config.max_concurrent = 1;
        config.lease_ttl_ms = 500;
        let mut state = BucketState::default();

        assert!(matches!(
            state.reserve(&config, "crashed", 0),
            Reservation::Granted { .. }
        ));
        assert!(matches!(
            state.reserve(&config, "next", 100),
            Reservation::Wait { .. }
        ));
        assert!(matches!(
            state.reserve(&config, "next", 500),
            Reservation::Granted { .. }
        ));
    }

    #[test]
    fn test_start_times_are_spaced() {
        let mut config = config(100, 100, 60_000);
        config.min_time_ms = 200;
        let mut state = BucketState::default();

        let starts: Vec<u64> = (0..4)
            .map(|i| match state.reserve(&config, &format!("l{i}"), 0) {
                Reservation::Granted { start_at_ms } => start_at_ms,
                other => panic!("unexpected {other:?}"),
            })
            .collect();

        assert_eq!(starts, vec![0, 200, 400, 600]);
    }

    #[test]
    fn test_zero_interval_never_refills() {
        let config = config(1, 1, 0);
        let mut state = BucketState::default();

        assert!(matches!(
            state.reserve(&config, "a", 0),
            Reservation::Granted { .. }
        ));
        assert_eq!(
            state.reserve(&config, "b", 1_000_000),
            Reservation::Wait {
                retry_after_ms: u64::MAX
            }
        );
    }
}
