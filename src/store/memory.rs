//! In-memory counter store.
//!
//! Suitable for single-instance deployments and tests. Each key lives in a
//! `DashMap` shard; holding the shard entry while incrementing gives the
//! same increment-and-arm-expiry atomicity the Redis script provides.
//!
//! Expired windows are swept every [`PURGE_INTERVAL`] increments, and a
//! peek that finds an expired window drops it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{CounterSnapshot, CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

/// Increments between sweeps of expired windows.
pub const PURGE_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u64,
    expires_at: Instant,
}

impl WindowEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    fn snapshot(&self, now: Instant) -> CounterSnapshot {
        CounterSnapshot {
            count: self.count,
            ttl: self.expires_at.saturating_duration_since(now),
        }
    }
}

/// Counter store held in process memory.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<String, WindowEntry>,
    increments: AtomicU64,
    /// Number of store operations issued per key, for observing traffic.
    #[cfg(any(test, feature = "test-helpers"))]
    operations: DashMap<String, u64>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            increments: AtomicU64::new(0),
            #[cfg(any(test, feature = "test-helpers"))]
            operations: DashMap::new(),
            clock,
        }
    }

    /// Number of operations (increment, peek or release) issued against `key`.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn operations_for(&self, key: &str) -> u64 {
        self.operations.get(key).map(|n| *n).unwrap_or(0)
    }

    /// Number of operations issued against every key starting with `prefix`.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn operations_with_prefix(&self, prefix: &str) -> u64 {
        self.operations
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| *entry.value())
            .sum()
    }

    /// Current count for `key`, or zero if no window is open.
    pub fn count(&self, key: &str) -> u64 {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    /// Drop expired windows.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.counters.retain(|_, entry| !entry.is_expired(now));
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Remove every counter and operation record.
    pub fn clear(&self) {
        self.counters.clear();
        #[cfg(any(test, feature = "test-helpers"))]
        self.operations.clear();
    }

    #[cfg(any(test, feature = "test-helpers"))]
    fn record_operation(&self, key: &str) {
        *self.operations.entry(key.to_string()).or_insert(0) += 1;
    }

    #[cfg(not(any(test, feature = "test-helpers")))]
    fn record_operation(&self, _key: &str) {}
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        self.record_operation(key);

        // Sweep before taking the entry; retain locks every shard.
        if (self.increments.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_INTERVAL == 0 {
            self.purge_expired();
        }
        let now = self.clock.now();

        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                expires_at: now + window,
            });

        if entry.is_expired(now) {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;

        let snapshot = entry.snapshot(now);
        trace!(key = %key, count = snapshot.count, ttl_ms = snapshot.ttl.as_millis() as u64, "Incremented counter");
        Ok(snapshot)
    }

    async fn peek(&self, key: &str) -> Result<Option<CounterSnapshot>, StoreError> {
        self.record_operation(key);
        let now = self.clock.now();

        let snapshot = self.counters.get(key).map(|entry| (entry.is_expired(now), entry.snapshot(now)));
        match snapshot {
            Some((false, snapshot)) => Ok(Some(snapshot)),
            Some((true, _)) => {
                self.counters.remove_if(key, |_, entry| entry.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.record_operation(key);
        let now = self.clock.now();

        if let Some(mut entry) = self.counters.get_mut(key) {
            if !entry.is_expired(now) {
                entry.count = entry.count.saturating_sub(1);
            }
        }
        Ok(())
    }
}
