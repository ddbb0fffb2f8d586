use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    clients::rate_limiter::{LimiterBackend, Reservation, SLOT_POLL_MS},
    errors::DispatchError,
    models::{retry::RetryConfig, throttler::ThrottlerConfig},
    utils::retry_with_backoff,
};

/// Connection to the coordination store shared by every instance.
#[derive(Clone)]
pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    pub async fn connect(redis_url: &str, retry_config: &RetryConfig) -> Result<Self, DispatchError> {
        info!("Connecting to Redis");

        let client = Client::open(redis_url)
            .map_err(|e| DispatchError::Configuration(format!("Invalid redis url: {}", e)))?;

        let connection = retry_with_backoff(retry_config, || {
            let client = client.clone();
            async move { client.get_multiplexed_async_connection().await }
        })
        .await
        .map_err(|e| DispatchError::Coordination(format!("Failed to connect to redis: {}", e)))?;

        info!("Redis connection established");

        Ok(Self { connection })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub async fn ping(&self) -> Result<(), DispatchError> {
        let mut conn = self.connection.clone();
        conn.ping::<String>().await?;
        Ok(())
    }
}

// KEYS: state hash, lease sorted set.
// ARGV: now, max_concurrent, min_time, reservoir, refresh amount, refresh
// interval, lease id, lease ttl, slot poll.
// Returns {1, start_at} when granted, {0, retry_after} otherwise.
const RESERVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local max_concurrent = tonumber(ARGV[2])
local min_time = tonumber(ARGV[3])
local size = tonumber(ARGV[4])
local refresh_amount = tonumber(ARGV[5])
local refresh_interval = tonumber(ARGV[6])
local lease_id = ARGV[7]
local lease_ttl = tonumber(ARGV[8])
local slot_poll = tonumber(ARGV[9])

local state = redis.call('HMGET', KEYS[1], 'reservoir', 'last_refill', 'next_start')
local level = tonumber(state[1]) or size
local last_refill = tonumber(state[2]) or now
local next_start = tonumber(state[3]) or 0

if refresh_interval > 0 and now >= last_refill + refresh_interval then
  local intervals = math.floor((now - last_refill) / refresh_interval)
  level = level + intervals * refresh_amount
  last_refill = last_refill + intervals * refresh_interval
end
if level > size then
  level = size
end

redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now)
local running = redis.call('ZCARD', KEYS[2])

if running >= max_concurrent then
  redis.call('HSET', KEYS[1], 'reservoir', level, 'last_refill', last_refill, 'next_start', next_start)
  return {0, slot_poll}
end

if level < 1 then
  redis.call('HSET', KEYS[1], 'reservoir', level, 'last_refill', last_refill, 'next_start', next_start)
  if refresh_interval <= 0 then
    return {0, -1}
  end
  return {0, math.max(last_refill + refresh_interval - now, 1)}
end

local start_at = math.max(now, next_start)
redis.call('HSET', KEYS[1], 'reservoir', level - 1, 'last_refill', last_refill, 'next_start', start_at + min_time)
redis.call('ZADD', KEYS[2], start_at + lease_ttl, lease_id)
return {1, start_at}
"#;

const LEVEL_SCRIPT: &str = r#"
local size = tonumber(ARGV[1])
local refresh_amount = tonumber(ARGV[2])
local refresh_interval = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'reservoir', 'last_refill')
local level = tonumber(state[1]) or size
local last_refill = tonumber(state[2]) or now

if refresh_interval > 0 and now >= last_refill + refresh_interval then
  local intervals = math.floor((now - last_refill) / refresh_interval)
  level = level + intervals * refresh_amount
end
if level > size then
  level = size
end
return level
"#;

/// Limiter state kept in Redis so every instance draws from one reservoir.
pub struct RedisLimiterBackend {
    state_key: String,
    lease_key: String,
    connection: RwLock<Option<MultiplexedConnection>>,
    reserve_script: Script,
    level_script: Script,
}

impl RedisLimiterBackend {
    pub fn new(name: &str, client: &RedisClient) -> Self {
        info!(throttler = name, "Redis limiter backend initialized");

        Self {
            state_key: format!("throttler:{}:state", name),
            lease_key: format!("throttler:{}:leases", name),
            connection: RwLock::new(Some(client.connection())),
            reserve_script: Script::new(RESERVE_SCRIPT),
            level_script: Script::new(LEVEL_SCRIPT),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, DispatchError> {
        self.connection.read().await.clone().ok_or_else(|| {
            DispatchError::Coordination("Limiter backend is disconnected".to_string())
        })
    }
}

#[async_trait]
impl LimiterBackend for RedisLimiterBackend {
    async fn reserve(
        &self,
        config: &ThrottlerConfig,
        lease_id: &str,
        now_ms: u64,
    ) -> Result<Reservation, DispatchError> {
        let mut conn = self.connection().await?;

        let (granted, value): (i64, i64) = self
            .reserve_script
            .key(&self.state_key)
            .key(&self.lease_key)
            .arg(now_ms)
            .arg(config.max_concurrent)
            .arg(config.min_time_ms)
            .arg(config.reservoir)
            .arg(config.reservoir_refresh_amount)
            .arg(config.reservoir_refresh_interval_ms)
            .arg(lease_id)
            .arg(config.lease_ttl_ms)
            .arg(SLOT_POLL_MS)
            .invoke_async(&mut conn)
            .await?;

        if granted == 1 {
            return Ok(Reservation::Granted {
                start_at_ms: value.max(0) as u64,
            });
        }

        let retry_after_ms = if value < 0 { u64::MAX } else { value as u64 };
        Ok(Reservation::Wait { retry_after_ms })
    }

    async fn release(&self, lease_id: &str) -> Result<(), DispatchError> {
        let mut conn = self.connection().await?;
        conn.zrem::<_, _, ()>(&self.lease_key, lease_id).await?;
        Ok(())
    }

    async fn reservoir_level(
        &self,
        config: &ThrottlerConfig,
        now_ms: u64,
    ) -> Result<u32, DispatchError> {
        let mut conn = self.connection().await?;

        let level: i64 = self
            .level_script
            .key(&self.state_key)
            .arg(config.reservoir)
            .arg(config.reservoir_refresh_amount)
            .arg(config.reservoir_refresh_interval_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(level.clamp(0, i64::from(config.reservoir)) as u32)
    }

    async fn disconnect(&self) -> Result<(), DispatchError> {
        if self.connection.write().await.take().is_none() {
            warn!("Redis limiter backend already disconnected");
        }
        Ok(())
    }
}
