use serde::{Deserialize, Serialize};

/// Limits applied by the shared email throttler.
///
/// Every field is optional when deserialized; missing values fall back to
/// the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// Maximum sends in flight across all instances.
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: u32,

    /// Minimum spacing between two dispatch start times.
    #[serde(default = "defaults::min_time_ms")]
    pub min_time_ms: u64,

    /// Reservoir capacity and starting level.
    #[serde(default = "defaults::reservoir")]
    pub reservoir: u32,

    #[serde(default = "defaults::reservoir_refresh_amount")]
    pub reservoir_refresh_amount: u32,

    #[serde(default = "defaults::reservoir_refresh_interval_ms")]
    pub reservoir_refresh_interval_ms: u64,

    /// How long a task may wait for a slot before it is dropped.
    #[serde(default = "defaults::max_wait_ms")]
    pub max_wait_ms: u64,

    /// Expiry of a held concurrency slot, so a crashed instance cannot leak it.
    #[serde(default = "defaults::lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Time `stop()` waits for in-flight sends. Zero abandons them.
    #[serde(default = "defaults::drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            min_time_ms: defaults::min_time_ms(),
            reservoir: defaults::reservoir(),
            reservoir_refresh_amount: defaults::reservoir_refresh_amount(),
            reservoir_refresh_interval_ms: defaults::reservoir_refresh_interval_ms(),
            max_wait_ms: defaults::max_wait_ms(),
            lease_ttl_ms: defaults::lease_ttl_ms(),
            drain_timeout_ms: defaults::drain_timeout_ms(),
        }
    }
}

mod defaults {
    pub const fn max_concurrent() -> u32 {
        5
    }

    pub const fn min_time_ms() -> u64 {
        200
    }

    pub const fn reservoir() -> u32 {
        100
    }

    pub const fn reservoir_refresh_amount() -> u32 {
        100
    }

    pub const fn reservoir_refresh_interval_ms() -> u64 {
        60_000
    }

    pub const fn max_wait_ms() -> u64 {
        120_000
    }

    pub const fn lease_ttl_ms() -> u64 {
        120_000
    }

    pub const fn drain_timeout_ms() -> u64 {
        10_000
    }
}
