//! Redis-backed counter store.
//!
//! Counters are plain integer keys with a millisecond TTL. Increment,
//! conditional expiry and TTL read-back run inside one Lua script so that
//! Redis executes them as a single atomic unit; concurrent first hits of a
//! window therefore always agree on one expiry.
//!
//! The script also re-arms the expiry when it finds a counter without one,
//! which repairs keys left behind by a client that crashed between
//! commands of an older, non-scripted deployment.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::debug;

use super::{CounterSnapshot, CounterStore, StoreError};

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

const RELEASE_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]))
if count and count > 0 then
  return redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Configuration for the Redis counter store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every counter key (default: "rl").
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rl".to_string(),
        }
    }
}

/// Counter store shared by every service instance through Redis.
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    increment_script: Script,
    release_script: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns an error if the client cannot be created or the server does
    /// not answer a `PING`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        let mut conn = connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        debug!(prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            config,
            increment_script: Script::new(INCREMENT_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    /// Get the Redis key for a counter key.
    fn key(&self, key: &str) -> String {
        if self.config.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.config.key_prefix, key)
        }
    }
}

/// Convert a PTTL reply into a duration. Negative replies mean "no key"
/// (-2) or "no expiry" (-1).
fn ttl_from_millis(ttl_ms: i64) -> Option<Duration> {
    u64::try_from(ttl_ms).ok().map(Duration::from_millis)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        let mut conn = self.connection.clone();
        let window_ms = window.as_millis().max(1) as u64;

        let mut invocation = self.increment_script.key(self.key(key));
        invocation.arg(window_ms);
        let (count, ttl_ms): (i64, i64) = invocation.invoke_async(&mut conn).await?;

        let count = u64::try_from(count)
            .map_err(|_| StoreError::Protocol(format!("negative counter value {}", count)))?;
        let ttl = ttl_from_millis(ttl_ms)
            .ok_or_else(|| StoreError::Protocol(format!("counter has no expiry (PTTL {})", ttl_ms)))?;

        Ok(CounterSnapshot { count, ttl })
    }

    async fn peek(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
        let mut conn = self.connection.clone();
        let redis_key = self.key(key);

        let (count, ttl_ms): (Option<u64>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(&redis_key)
            .cmd("PTTL")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;

        Ok(match (count, ttl_from_millis(ttl_ms)) {
            (Some(count), Some(ttl)) => Some(CounterSnapshot { count, ttl }),
            _ => None,
        })
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();

        let _: i64 = self
            .release_script
            .key(self.key(key))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Unavailable(format!("timeout: {}", err))
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else if err.kind() == redis::ErrorKind::TypeError {
            StoreError::Protocol(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}
