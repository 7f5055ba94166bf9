//! Aggregate admission counters.
//!
//! Individual fail-open decisions look like successes to callers; these
//! counters are how a degraded counter store becomes visible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Shared admission statistics. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    allowed: AtomicU64,
    denied: AtomicU64,
    skipped: AtomicU64,
    fail_open: AtomicU64,
    released: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.inner.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.inner.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fail_open(&self) {
        self.inner.fail_open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self) {
        self.inner.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.inner.allowed.load(Ordering::Relaxed),
            denied: self.inner.denied.load(Ordering::Relaxed),
            skipped: self.inner.skipped.load(Ordering::Relaxed),
            fail_open: self.inner.fail_open.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests admitted after counting or checking
    pub allowed: u64,
    /// Requests refused
    pub denied: u64,
    /// Requests that bypassed a limiter
    pub skipped: u64,
    /// Requests admitted because the counter store failed
    pub fail_open: u64,
    /// Provisional hits handed back (composite rollbacks, uncounted outcomes)
    pub released: u64,
}

impl MetricsSnapshot {
    /// Fraction of evaluations that failed open.
    pub fn fail_open_ratio(&self) -> f64 {
        let total = self.allowed + self.denied + self.fail_open;
        if total == 0 {
            0.0
        } else {
            self.fail_open as f64 / total as f64
        }
    }
}
