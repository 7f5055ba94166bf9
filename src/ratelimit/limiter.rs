//! Fixed-window limiter.
//!
//! A [`Limiter`] binds one [`Policy`] to a counter store. Every store round
//! trip is bounded by a timeout, and any store failure admits the request:
//! admission control trades strictness for availability so that a degraded
//! store can never take the guarded service down with it.
//!
//! Outcome-counted policies (the auth tier) still count every attempt up
//! front. Once the outcome is known, [`Limiter::record`] hands the hit back
//! if the policy's predicate says it should not count. Concurrent attempts
//! therefore always see each other.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, trace, warn};

use super::context::{Outcome, RequestContext};
use super::decision::{Decision, DecisionSource};
use super::key::CounterKey;
use super::metrics::Metrics;
use super::policy::Policy;
use super::rejection::Rejection;
use crate::store::{CounterStore, StoreError};

/// Default bound on a single counter store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// An evaluated request and the hit it may hold in the store.
#[derive(Debug, Clone)]
pub struct Admission {
    key: CounterKey,
    decision: Decision,
}

impl Admission {
    /// The admission decision.
    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    /// Key the request was counted under.
    pub fn key(&self) -> &CounterKey {
        &self.key
    }

    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        self.decision.allowed
    }

    /// Whether a hit was written to the store for this request.
    pub fn holds_hit(&self) -> bool {
        self.decision.source == DecisionSource::Counted
    }

    /// Whether the window the hit was counted in is still open. Handing a
    /// hit back after that would credit the next window instead.
    fn window_open(&self) -> bool {
        Utc::now() < self.decision.reset_at
    }
}

/// Evaluates requests against one policy.
///
/// Cheap to clone; clones share the policy, store and metrics.
#[derive(Clone)]
pub struct Limiter {
    policy: Arc<Policy>,
    store: Arc<dyn CounterStore>,
    store_timeout: Duration,
    metrics: Metrics,
}

impl Limiter {
    /// Create a limiter for `policy` backed by `store`.
    pub fn new(policy: Policy, store: Arc<dyn CounterStore>) -> Self {
        Self {
            policy: Arc::new(policy),
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            metrics: Metrics::new(),
        }
    }

    /// Bound each store round trip by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Report into shared metrics.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Tier name used in diagnostics.
    pub fn name(&self) -> &str {
        self.policy.name()
    }

    /// Metrics this limiter reports into.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Evaluate a request before it runs, consuming one unit of quota.
    ///
    /// For outcome-counted policies use [`Limiter::precheck`] and
    /// [`Limiter::record`] (or [`Limiter::run`]) so the hit can be handed
    /// back when the outcome does not count.
    pub async fn evaluate(&self, ctx: &RequestContext) -> Decision {
        self.precheck(ctx).await.decision
    }

    /// Count the request provisionally before it runs.
    ///
    /// The request is refused once the window holds more than the cap.
    /// Pass the returned admission to [`Limiter::record`] when the
    /// operation completes.
    pub async fn precheck(&self, ctx: &RequestContext) -> Admission {
        if self.policy.should_skip(ctx) {
            return self.skip(ctx);
        }
        let admission = self.reserve(ctx).await;
        self.report(&admission);
        admission
    }

    /// Settle a provisional hit once the outcome is known.
    ///
    /// The hit is handed back when the policy's predicate rejects the
    /// outcome. Returns whether the request stays counted. Refused
    /// requests stay counted regardless of outcome.
    pub async fn record(&self, ctx: &RequestContext, admission: &Admission, outcome: &Outcome) -> bool {
        if !admission.holds_hit() {
            return false;
        }
        if !admission.is_allowed() || self.policy.should_count(ctx, outcome) {
            return true;
        }
        trace!(tier = %self.name(), status = outcome.status, "Outcome not counted");
        self.release(admission).await;
        false
    }

    /// Read the quota without consuming it.
    ///
    /// Refuses once the window already holds `limit` hits. Nothing is
    /// reserved, so concurrent callers may all pass; use it for status
    /// reporting, never to guard an operation.
    pub async fn inspect(&self, ctx: &RequestContext) -> Decision {
        let key = self.policy.key_for(ctx);
        match self.bounded(self.store.peek(&key.to_store_key())).await {
            Ok(snapshot) => Decision::checked(
                self.policy.max_requests(),
                snapshot,
                self.policy.window(),
                Utc::now(),
            ),
            Err(e) => self.fail_open(&key, e),
        }
    }

    /// Run `op` under this limiter.
    ///
    /// `op` returns its value together with the outcome used by
    /// outcome-counted policies.
    pub async fn run<T, F, Fut>(&self, ctx: &RequestContext, op: F) -> Result<T, Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (T, Outcome)>,
    {
        let admission = self.precheck(ctx).await;
        if !admission.is_allowed() {
            return Err(self.rejection(admission.decision()));
        }

        let (value, outcome) = op().await;
        self.record(ctx, &admission, &outcome).await;
        Ok(value)
    }

    /// Render the rejection payload for a denied decision.
    pub fn rejection(&self, decision: &Decision) -> Rejection {
        Rejection::new(self.policy.rejection(), self.name(), decision)
    }

    /// Count the request, ignoring the skip predicate. Nothing is reported
    /// to metrics except store failures.
    pub(crate) async fn reserve(&self, ctx: &RequestContext) -> Admission {
        let key = self.policy.key_for(ctx);

        trace!(tier = %self.name(), key = %key, "Counting request");

        let result = self
            .bounded(self.store.increment(&key.to_store_key(), self.policy.window()))
            .await;

        let decision = match result {
            Ok(snapshot) => Decision::counted(self.policy.max_requests(), snapshot, Utc::now()),
            Err(e) => self.fail_open(&key, e),
        };
        Admission { key, decision }
    }

    /// Hand back a hit counted by [`Limiter::reserve`].
    ///
    /// Does nothing when no hit was written or its window has closed.
    pub(crate) async fn release(&self, admission: &Admission) {
        if !admission.holds_hit() {
            return;
        }
        if !admission.window_open() {
            debug!(tier = %self.name(), key = %admission.key, "Window closed, reservation not released");
            return;
        }

        let store_key = admission.key.to_store_key();
        match self.bounded(self.store.release(&store_key)).await {
            Ok(()) => {
                self.metrics.record_released();
                debug!(tier = %self.name(), key = %admission.key, "Released reservation");
            }
            Err(e) => {
                warn!(tier = %self.name(), key = %admission.key, error = %e, "Failed to release reservation");
            }
        }
    }

    fn skip(&self, ctx: &RequestContext) -> Admission {
        self.metrics.record_skipped();
        trace!(tier = %self.name(), path = ?ctx.path, "Request skipped by policy");
        Admission {
            key: self.policy.key_for(ctx),
            decision: Decision::skipped(self.policy.max_requests(), self.policy.window(), Utc::now()),
        }
    }

    async fn bounded<T, Fut>(&self, fut: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    /// Record the admission in metrics and logs. Fail-open admissions were
    /// already reported when the store failed.
    pub(crate) fn report(&self, admission: &Admission) {
        let (key, decision) = (&admission.key, &admission.decision);
        if !admission.holds_hit() {
            return;
        }
        if decision.allowed {
            self.metrics.record_allowed();
            trace!(
                tier = %self.name(),
                key = %key,
                count = decision.current,
                limit = decision.limit,
                "Request admitted"
            );
        } else {
            self.metrics.record_denied();
            warn!(
                tier = %self.name(),
                key = %key,
                count = decision.current,
                limit = decision.limit,
                retry_after_secs = decision.retry_after.map(|d| d.as_secs()).unwrap_or(0),
                outcome = "denied",
                "Rate limit exceeded"
            );
        }
    }

    fn fail_open(&self, key: &CounterKey, err: StoreError) -> Decision {
        self.metrics.record_fail_open();
        error!(
            tier = %self.name(),
            key = %key,
            count = "unknown",
            limit = self.policy.max_requests(),
            error = %err,
            outcome = "fail-open",
            "Counter store failed, admitting request"
        );
        Decision::fail_open(self.policy.max_requests(), self.policy.window(), Utc::now())
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("policy", &self.policy)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}
