//! Multi-scope admission for one metered operation.
//!
//! A [`CompositeController`] runs an ordered list of limiters, one per
//! scope, and admits a request only when every stage admits it. Stages are
//! evaluated strictly in order and evaluation stops at the first denial,
//! so later stages are never charged for a request an earlier stage
//! refused.
//!
//! Each stage reserves quota as it passes. When a stage denies, the denying
//! stage's hit and every earlier reservation are released again, so a
//! rejected request consumes no quota at any scope.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::context::RequestContext;
use super::decision::Decision;
use super::key::{KeyStrategy, Scope};
use super::limiter::{Admission, Limiter};
use super::metrics::Metrics;
use super::policy::{Policy, SkipPredicate};
use super::rejection::{Rejection, RejectionTemplate, STATUS_SERVICE_UNAVAILABLE};
use crate::config::MapGenerationConfig;
use crate::error::Result;
use crate::store::CounterStore;

/// Where a composite evaluation is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "scope")]
pub enum CompositeState {
    Start,
    SkipCheck,
    /// Evaluating the stage for a scope
    Checking(Scope),
    /// Every stage admitted the request
    Admitted,
    /// The skip predicate matched; no quota was touched
    Skipped,
    /// The stage for a scope refused the request
    Denied(Scope),
}

impl CompositeState {
    /// Whether evaluation has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompositeState::Admitted | CompositeState::Skipped | CompositeState::Denied(_)
        )
    }

    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, CompositeState::Admitted | CompositeState::Skipped)
    }
}

/// One evaluated stage, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub scope: Scope,
    pub tier: String,
    pub decision: Decision,
}

/// Result of a composite evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct CompositeOutcome {
    /// Terminal state
    pub state: CompositeState,
    /// Stages evaluated, in order
    pub trail: Vec<StageRecord>,
    /// Payload for the caller when denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl CompositeOutcome {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        self.state.is_admitted()
    }

    /// Scope that denied the request, if any.
    pub fn denied_scope(&self) -> Option<Scope> {
        match self.state {
            CompositeState::Denied(scope) => Some(scope),
            _ => None,
        }
    }

    /// Decision of the denying stage, if any.
    pub fn denial(&self) -> Option<&Decision> {
        self.denied_scope()?;
        self.trail.last().map(|record| &record.decision)
    }
}

#[derive(Clone)]
struct Stage {
    scope: Scope,
    limiter: Limiter,
}

/// Ordered multi-scope admission controller.
///
/// Store failures at any stage admit the request at that stage (fail
/// open); evaluation then continues with the next stage.
#[derive(Clone)]
pub struct CompositeController {
    name: String,
    stages: Vec<Stage>,
    skip: Option<SkipPredicate>,
    metrics: Metrics,
}

impl CompositeController {
    /// Create a controller with no stages.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            skip: None,
            metrics: Metrics::new(),
        }
    }

    /// Append a stage. Stages run in the order they are added.
    pub fn stage(mut self, scope: Scope, limiter: Limiter) -> Self {
        let limiter = limiter.with_metrics(self.metrics.clone());
        self.stages.push(Stage { scope, limiter });
        self
    }

    /// Bypass every stage for requests matching `predicate`.
    pub fn with_skip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    /// The map-generation guard: per-IP, then per-identity, then global,
    /// bypassed entirely when the caller already supplies an image.
    ///
    /// # Errors
    /// Returns [`crate::TurnstileError::Config`] if any scope is
    /// misconfigured.
    pub fn map_generation(
        config: &MapGenerationConfig,
        store: Arc<dyn CounterStore>,
        store_timeout: Duration,
    ) -> Result<Self> {
        let mut controller =
            CompositeController::new("map_generation").with_skip(RequestContext::has_supplied_output);

        for (scope, policy) in map_generation_policies(config)? {
            let limiter = Limiter::new(policy, Arc::clone(&store)).with_store_timeout(store_timeout);
            controller = controller.stage(scope, limiter);
        }
        Ok(controller)
    }

    /// Controller name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scopes in evaluation order.
    pub fn scopes(&self) -> Vec<Scope> {
        self.stages.iter().map(|stage| stage.scope).collect()
    }

    /// Metrics shared by every stage.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Evaluate a request against every stage.
    pub async fn evaluate(&self, ctx: &RequestContext) -> CompositeOutcome {
        let mut state = CompositeState::Start;
        self.transition(&mut state, CompositeState::SkipCheck);

        // Decided once; stages below never re-check it.
        let skipped = self.skip.as_ref().map(|skip| skip(ctx)).unwrap_or(false);
        if skipped {
            self.metrics.record_skipped();
            self.transition(&mut state, CompositeState::Skipped);
            return CompositeOutcome {
                state,
                trail: Vec::new(),
                rejection: None,
            };
        }

        let mut trail = Vec::with_capacity(self.stages.len());
        let mut reserved: Vec<(&Limiter, Admission)> = Vec::with_capacity(self.stages.len());

        for stage in self.stages.iter() {
            self.transition(&mut state, CompositeState::Checking(stage.scope));

            let admission = stage.limiter.reserve(ctx).await;
            let decision = admission.decision();
            debug!(
                controller = %self.name,
                scope = %stage.scope,
                tier = %stage.limiter.name(),
                allowed = decision.allowed,
                count = decision.current,
                "Stage evaluated"
            );
            trail.push(StageRecord {
                scope: stage.scope,
                tier: stage.limiter.name().to_string(),
                decision: decision.clone(),
            });

            if !decision.allowed {
                stage.limiter.release(&admission).await;
                for (limiter, earlier) in reserved.iter().rev() {
                    limiter.release(earlier).await;
                }
                self.metrics.record_denied();

                let rejection = stage.limiter.rejection(decision).with_scope(stage.scope);
                self.transition(&mut state, CompositeState::Denied(stage.scope));
                warn!(
                    controller = %self.name,
                    scope = %stage.scope,
                    tier = %stage.limiter.name(),
                    key = %admission.key(),
                    count = decision.current,
                    limit = decision.limit,
                    released = reserved.len(),
                    trail = ?trail_summary(&trail),
                    outcome = "denied",
                    "Composite admission denied"
                );
                return CompositeOutcome {
                    state,
                    trail,
                    rejection: Some(rejection),
                };
            }

            if admission.holds_hit() {
                reserved.push((&stage.limiter, admission));
            }
        }

        // Stages are only reported once nothing can roll them back.
        for (limiter, admission) in &reserved {
            limiter.report(admission);
        }
        self.transition(&mut state, CompositeState::Admitted);
        debug!(
            controller = %self.name,
            trail = ?trail_summary(&trail),
            "Composite admission granted"
        );
        CompositeOutcome {
            state,
            trail,
            rejection: None,
        }
    }

    /// Run `op` only if every stage admits the request.
    pub async fn run<T, Fut>(&self, ctx: &RequestContext, op: Fut) -> std::result::Result<T, Rejection>
    where
        Fut: Future<Output = T>,
    {
        let outcome = self.evaluate(ctx).await;
        match outcome.rejection {
            Some(rejection) => Err(rejection),
            None => Ok(op.await),
        }
    }

    fn transition(&self, state: &mut CompositeState, next: CompositeState) {
        debug_assert!(!state.is_terminal(), "no transitions out of {:?}", state);
        debug!(controller = %self.name, from = ?state, to = ?next, "Composite state transition");
        *state = next;
    }
}

impl fmt::Debug for CompositeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeController")
            .field("name", &self.name)
            .field("scopes", &self.scopes())
            .field("has_skip", &self.skip.is_some())
            .finish()
    }
}

fn trail_summary(trail: &[StageRecord]) -> Vec<(Scope, bool, u64)> {
    trail
        .iter()
        .map(|record| (record.scope, record.decision.allowed, record.decision.current))
        .collect()
}

/// Policies for the map-generation guard, in evaluation order.
pub fn map_generation_policies(config: &MapGenerationConfig) -> Result<Vec<(Scope, Policy)>> {
    let ip = Policy::from_rule("map:ip", &config.ip)?
        .with_key(KeyStrategy::Ip)
        .with_rejection(RejectionTemplate::new(
            "IP_MAP_LIMIT",
            "Too many map generation requests from this network",
        ));

    let identity = Policy::from_rule("map:identity", &config.identity)?
        .with_key(KeyStrategy::IdentityOrIp)
        .with_rejection(RejectionTemplate::new(
            "MAP_GENERATION_RATE_LIMIT",
            "Map generation limit reached",
        ));

    let global = Policy::from_rule("map:global", &config.global)?
        .with_key(KeyStrategy::global())
        .with_rejection(
            RejectionTemplate::new("GLOBAL_MAP_LIMIT", "The system is experiencing high demand")
                .with_status(STATUS_SERVICE_UNAVAILABLE),
        );

    Ok(vec![
        (Scope::Ip, ip),
        (Scope::Identity, identity),
        (Scope::Global, global),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitRule;
    use crate::ratelimit::limiter::test_support::FailingStore;
    use crate::store::MemoryCounterStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const IP_KEYS: &str = "map:ip:";
    const IDENTITY_KEYS: &str = "map:identity:";
    const GLOBAL_KEYS: &str = "map:global:";

    fn config(ip: u64, identity: u64, global: u64) -> MapGenerationConfig {
        MapGenerationConfig {
            ip: LimitRule::new(3_600_000, ip),
            identity: LimitRule::new(3_600_000, identity),
            global: LimitRule::new(3_600_000, global),
        }
    }

    fn controller(ip: u64, identity: u64, global: u64) -> (CompositeController, Arc<MemoryCounterStore>) {
        let store = Arc::new(MemoryCounterStore::new());
        let controller = CompositeController::map_generation(
            &config(ip, identity, global),
            store.clone(),
            Duration::from_millis(100),
        )
        .unwrap();
        (controller, store)
    }

    fn request(ip: &str, identity: &str) -> RequestContext {
        RequestContext::new(ip.parse().unwrap()).with_identity(identity)
    }

    #[test]
    fn test_stage_order() {
        let (controller, _store) = controller(1, 1, 1);
        assert_eq!(controller.scopes(), vec![Scope::Ip, Scope::Identity, Scope::Global]);
    }

    #[tokio::test]
    async fn test_all_stages_admit() {
        let (controller, store) = controller(10, 10, 10);

        let outcome = controller.evaluate(&request("10.0.0.1", "alice")).await;

        assert_eq!(outcome.state, CompositeState::Admitted);
        assert_eq!(outcome.trail.len(), 3);
        assert!(outcome.rejection.is_none());
        assert_eq!(store.count("map:ip:ip:10.0.0.1"), 1);
        assert_eq!(store.count("map:identity:user:alice"), 1);
        assert_eq!(store.count("map:global:const:global"), 1);
    }

    #[tokio::test]
    async fn test_ip_denial_never_reaches_later_stages() {
        let (controller, store) = controller(1, 5, 100);

        let first = controller.evaluate(&request("10.0.0.1", "alice")).await;
        assert!(first.is_admitted());

        let identity_ops = store.operations_with_prefix(IDENTITY_KEYS);
        let global_ops = store.operations_with_prefix(GLOBAL_KEYS);

        let second = controller.evaluate(&request("10.0.0.1", "bob")).await;
        assert_eq!(second.state, CompositeState::Denied(Scope::Ip));
        assert_eq!(second.denied_scope(), Some(Scope::Ip));
        assert_eq!(second.trail.len(), 1);

        assert_eq!(store.operations_with_prefix(IDENTITY_KEYS), identity_ops);
        assert_eq!(store.operations_with_prefix(GLOBAL_KEYS), global_ops);
        assert_eq!(store.operations_for("map:identity:user:bob"), 0);
        assert_eq!(store.count("map:global:const:global"), 1);
    }

    #[tokio::test]
    async fn test_rejected_requests_consume_no_quota() {
        let (controller, store) = controller(100, 100, 1);

        assert!(controller.evaluate(&request("10.0.0.1", "alice")).await.is_admitted());

        let denied = controller.evaluate(&request("10.0.0.2", "bob")).await;
        assert_eq!(denied.denied_scope(), Some(Scope::Global));

        // Bob's IP and identity reservations were handed back, and the
        // global counter does not keep the refused hit.
        assert_eq!(store.count("map:ip:ip:10.0.0.2"), 0);
        assert_eq!(store.count("map:identity:user:bob"), 0);
        assert_eq!(store.count("map:global:const:global"), 1);
        assert_eq!(controller.metrics().snapshot().released, 3);
    }

    #[tokio::test]
    async fn test_rolled_back_stages_are_not_reported_as_allowed() {
        let (controller, _store) = controller(100, 100, 1);

        controller.evaluate(&request("10.0.0.1", "alice")).await;
        controller.evaluate(&request("10.0.0.2", "bob")).await;

        let snapshot = controller.metrics().snapshot();
        assert_eq!(snapshot.allowed, 3);
        assert_eq!(snapshot.denied, 1);
    }

    #[tokio::test]
    async fn test_identity_denial_reports_scope_and_payload() {
        let (controller, _store) = controller(100, 1, 100);

        controller.evaluate(&request("10.0.0.1", "alice")).await;
        let outcome = controller.evaluate(&request("10.0.0.2", "alice")).await;

        assert_eq!(outcome.state, CompositeState::Denied(Scope::Identity));
        let rejection = outcome.rejection.unwrap();
        assert_eq!(rejection.code, "MAP_GENERATION_RATE_LIMIT");
        assert_eq!(rejection.scope, Some(Scope::Identity));
        assert_eq!(rejection.status, 429);
        assert_eq!(rejection.limit, 1);
    }

    #[tokio::test]
    async fn test_global_denial_is_service_unavailable() {
        let (controller, _store) = controller(100, 100, 1);

        controller.evaluate(&request("10.0.0.1", "alice")).await;
        let outcome = controller.evaluate(&request("10.0.0.2", "bob")).await;

        let denial = outcome.denial().unwrap();
        assert!(!denial.allowed);
        let rejection = outcome.rejection.unwrap();
        assert_eq!(rejection.code, "GLOBAL_MAP_LIMIT");
        assert_eq!(rejection.status, 503);
    }

    #[tokio::test]
    async fn test_supplied_output_skips_every_stage() {
        let (controller, store) = controller(1, 1, 1);
        let ctx = request("10.0.0.1", "alice").with_supplied_output("https://cdn.example.com/map.png");

        for _ in 0..5 {
            let outcome = controller.evaluate(&ctx).await;
            assert_eq!(outcome.state, CompositeState::Skipped);
            assert!(outcome.trail.is_empty());
        }
        assert_eq!(store.operations_with_prefix(IP_KEYS), 0);
        assert_eq!(store.operations_with_prefix(IDENTITY_KEYS), 0);
        assert_eq!(store.operations_with_prefix(GLOBAL_KEYS), 0);
    }

    #[tokio::test]
    async fn test_skip_is_decided_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let policy = |name: &str| Policy::new(name, Duration::from_secs(60), 10).unwrap();

        let counter = Arc::clone(&calls);
        let controller = CompositeController::new("custom")
            .with_skip(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })
            .stage(Scope::Ip, Limiter::new(policy("a").with_key(KeyStrategy::Ip), store.clone()))
            .stage(Scope::Identity, Limiter::new(policy("b"), store.clone()))
            .stage(Scope::Global, Limiter::new(policy("c").with_key(KeyStrategy::global()), store));

        let outcome = controller.evaluate(&request("10.0.0.1", "alice")).await;
        assert!(outcome.is_admitted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stage_store_failure_fails_open() {
        let controller = CompositeController::map_generation(
            &config(1, 1, 1),
            Arc::new(FailingStore),
            Duration::from_millis(50),
        )
        .unwrap();

        for _ in 0..3 {
            let outcome = controller.evaluate(&request("10.0.0.1", "alice")).await;
            assert_eq!(outcome.state, CompositeState::Admitted);
            assert!(outcome.trail.iter().all(|record| record.decision.is_fail_open()));
        }
        assert_eq!(controller.metrics().snapshot().fail_open, 9);
    }

    #[tokio::test]
    async fn test_run_invokes_operation_only_when_admitted() {
        let (controller, _store) = controller(1, 10, 10);
        let ctx = request("10.0.0.1", "alice");

        let rendered = controller.run(&ctx, async { "map.png" }).await;
        assert_eq!(rendered.unwrap(), "map.png");

        let invoked = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&invoked);
        let denied = controller
            .run(&ctx, async move {
                flag.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(denied.unwrap_err().code, "IP_MAP_LIMIT");
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_misconfigured_scope_is_rejected() {
        let store = Arc::new(MemoryCounterStore::new());
        let result = CompositeController::map_generation(&config(1, 0, 1), store, Duration::from_millis(50));
        assert!(result.is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CompositeState::Start.is_terminal());
        assert!(!CompositeState::Checking(Scope::Ip).is_terminal());
        assert!(CompositeState::Denied(Scope::Global).is_terminal());
        assert!(CompositeState::Skipped.is_admitted());
        assert!(!CompositeState::Denied(Scope::Ip).is_admitted());
    }
}
