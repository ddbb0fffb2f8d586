use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-local dispatch counters. Reset on restart.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    sent: AtomicU64,
    throttled: AtomicU64,
    errored: AtomicU64,
    queued: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispatchMetricsSnapshot {
    pub total_sent: u64,
    pub total_throttled: u64,
    pub total_errored: u64,
    pub queued: u64,
}

impl DispatchMetrics {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_errored(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts the caller as queued until the guard is dropped, including when
    /// the waiting future is cancelled.
    pub(crate) fn enter_queue(&self) -> QueuedGuard<'_> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        QueuedGuard { metrics: self }
    }

    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            total_sent: self.sent.load(Ordering::Relaxed),
            total_throttled: self.throttled.load(Ordering::Relaxed),
            total_errored: self.errored.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct QueuedGuard<'a> {
    metrics: &'a DispatchMetrics,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.metrics.queued.fetch_sub(1, Ordering::Relaxed);
    }
}

impl DispatchMetricsSnapshot {
    /// Zero sends is treated as one to keep the rates finite.
    fn denominator(&self) -> f64 {
        self.total_sent.max(1) as f64
    }

    pub fn error_rate(&self) -> f64 {
        self.total_errored as f64 / self.denominator() * 100.0
    }

    pub fn drop_rate(&self) -> f64 {
        self.total_throttled as f64 / self.denominator() * 100.0
    }
}
