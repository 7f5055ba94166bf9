//! Counter store abstraction.
//!
//! The admission engine never owns counter state. It talks to a shared
//! store through [`CounterStore`], whose only write primitive is an atomic
//! increment that arms the key's expiry on the first hit of a window.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::{MemoryCounterStore, PURGE_INTERVAL};
pub use self::redis_store::{RedisCounterStore, RedisStoreConfig};

/// Errors reported by a counter store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// A round trip exceeded the configured bound.
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected a command.
    #[error("counter store command failed: {0}")]
    Command(String),

    /// The store answered with something we could not interpret.
    #[error("unexpected counter store reply: {0}")]
    Protocol(String),
}

/// State of one counter after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Number of counted hits in the current window.
    pub count: u64,
    /// Time until the window closes and the key expires.
    pub ttl: Duration,
}

/// A shared counter store.
///
/// Implementations must make `increment` atomic: the increment and the
/// conditional expiry set happen as one unit, so concurrent first hits of
/// a window can never lose the TTL.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter at `key`, arming a `window` expiry if this is
    /// the first hit of a new window, and return the resulting state.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError>;

    /// Read the counter at `key` without modifying it.
    ///
    /// Returns `None` when no window is open for the key.
    async fn peek(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError>;

    /// Give back one previously counted hit.
    ///
    /// Never creates a key and never re-arms an expiry.
    async fn release(&self, key: &str) -> Result<(), StoreError>;
}
