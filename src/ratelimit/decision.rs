//! Admission decisions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::store::CounterSnapshot;

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionSource {
    /// The request was counted against the quota.
    Counted,
    /// The quota was inspected without counting the request.
    Checked,
    /// The policy's skip predicate matched; the store was not touched.
    Skipped,
    /// The counter store failed and the request was let through.
    FailOpen,
}

/// Result of evaluating one request against one limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured maximum for the window
    pub limit: u64,
    /// Count observed in the current window
    pub current: u64,
    /// `max(0, limit - current)`
    pub remaining: u64,
    /// When the current window closes and its counter expires
    pub reset_at: DateTime<Utc>,
    /// How long to wait before retrying; set only on denial
    #[serde(serialize_with = "serialize_secs")]
    pub retry_after: Option<Duration>,
    /// How the decision was reached
    pub source: DecisionSource,
}

impl Decision {
    /// Decision for a request that was just counted, given the counter
    /// state after the increment.
    pub fn counted(limit: u64, snapshot: CounterSnapshot, now: DateTime<Utc>) -> Self {
        let allowed = snapshot.count <= limit;
        Self {
            allowed,
            limit,
            current: snapshot.count,
            remaining: limit.saturating_sub(snapshot.count),
            reset_at: offset(now, snapshot.ttl),
            retry_after: (!allowed).then_some(snapshot.ttl),
            source: DecisionSource::Counted,
        }
    }

    /// Decision from inspecting the counter without counting. The request
    /// is refused once the window already holds `limit` counted hits, since
    /// counting it would exceed the cap.
    pub fn checked(
        limit: u64,
        snapshot: Option<CounterSnapshot>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let (count, ttl) = snapshot
            .map(|s| (s.count, s.ttl))
            .unwrap_or((0, window));
        let allowed = count < limit;
        Self {
            allowed,
            limit,
            current: count,
            remaining: limit.saturating_sub(count),
            reset_at: offset(now, ttl),
            retry_after: (!allowed).then_some(ttl),
            source: DecisionSource::Checked,
        }
    }

    /// Decision for a request the policy does not meter.
    pub fn skipped(limit: u64, window: Duration, now: DateTime<Utc>) -> Self {
        Self::unmetered(limit, window, now, DecisionSource::Skipped)
    }

    /// Decision for a request admitted because the store failed.
    pub fn fail_open(limit: u64, window: Duration, now: DateTime<Utc>) -> Self {
        Self::unmetered(limit, window, now, DecisionSource::FailOpen)
    }

    fn unmetered(limit: u64, window: Duration, now: DateTime<Utc>, source: DecisionSource) -> Self {
        Self {
            allowed: true,
            limit,
            current: 0,
            remaining: limit,
            reset_at: offset(now, window),
            retry_after: None,
            source,
        }
    }

    /// Whether the decision came from a degraded store.
    pub fn is_fail_open(&self) -> bool {
        self.source == DecisionSource::FailOpen
    }

    /// Standard rate-limit response headers for this decision.
    pub fn headers(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let reset_secs = ceil_secs((self.reset_at - now).to_std().unwrap_or_default());
        let mut headers = vec![
            ("RateLimit-Limit", self.limit.to_string()),
            ("RateLimit-Remaining", self.remaining.to_string()),
            ("RateLimit-Reset", reset_secs.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", ceil_secs(retry_after).to_string()));
        }
        headers
    }
}

fn offset(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Whole seconds, rounded up.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn serialize_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&ceil_secs(*duration)),
        None => serializer.serialize_none(),
    }
}
