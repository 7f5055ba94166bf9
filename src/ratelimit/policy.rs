//! Rate-limit policies.
//!
//! A [`Policy`] is validated when it is built; nothing downstream ever sees
//! a zero window or a zero cap.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::context::{Outcome, RequestContext};
use super::key::{CounterKey, KeyStrategy};
use super::rejection::RejectionTemplate;
use crate::config::LimitRule;
use crate::error::{Result, TurnstileError};

/// Decides whether a completed request counts against the quota.
pub type CountPredicate = Arc<dyn Fn(&RequestContext, &Outcome) -> bool + Send + Sync>;

/// Decides whether a request bypasses the limiter entirely.
pub type SkipPredicate = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;

/// Immutable rate-limit policy.
#[derive(Clone)]
pub struct Policy {
    name: String,
    namespace: String,
    window: Duration,
    max_requests: u64,
    key: KeyStrategy,
    count_predicate: Option<CountPredicate>,
    skip: Option<SkipPredicate>,
    rejection: RejectionTemplate,
}

impl Policy {
    /// Create a policy counting every request per caller identity or IP.
    ///
    /// # Errors
    /// Returns [`TurnstileError::Config`] if `window` is zero or
    /// `max_requests` is zero.
    pub fn new(name: impl Into<String>, window: Duration, max_requests: u64) -> Result<Self> {
        let name = name.into();
        if window.is_zero() {
            return Err(TurnstileError::Config(format!(
                "policy '{}': window must be greater than zero",
                name
            )));
        }
        if max_requests == 0 {
            return Err(TurnstileError::Config(format!(
                "policy '{}': max_requests must be at least 1",
                name
            )));
        }

        Ok(Self {
            namespace: name.clone(),
            name,
            window,
            max_requests,
            key: KeyStrategy::IdentityOrIp,
            count_predicate: None,
            skip: None,
            rejection: RejectionTemplate::default(),
        })
    }

    /// Create a policy from a configured rule.
    pub fn from_rule(name: impl Into<String>, rule: &LimitRule) -> Result<Self> {
        Self::new(name, rule.window(), rule.max_requests)
    }

    /// Use a different key derivation.
    pub fn with_key(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }

    /// Store counters under `namespace` instead of the policy name.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Count a request only once its outcome is known and `predicate`
    /// accepts it.
    pub fn with_count_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestContext, &Outcome) -> bool + Send + Sync + 'static,
    {
        self.count_predicate = Some(Arc::new(predicate));
        self
    }

    /// Count only failed attempts.
    pub fn count_failures_only(self) -> Self {
        self.with_count_predicate(|_, outcome| outcome.is_failure())
    }

    /// Bypass the limiter for requests matching `predicate`.
    pub fn with_skip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    /// Bypass the limiter when the caller already supplies an output.
    pub fn skip_when_output_supplied(self) -> Self {
        self.with_skip(RequestContext::has_supplied_output)
    }

    /// Use a custom rejection template.
    pub fn with_rejection(mut self, rejection: RejectionTemplate) -> Self {
        self.rejection = rejection;
        self
    }

    /// Policy name, used as the tier name in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Cap within one window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Key derivation strategy.
    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key
    }

    /// Rejection template.
    pub fn rejection(&self) -> &RejectionTemplate {
        &self.rejection
    }

    /// Derive the counter key for `ctx`.
    pub fn key_for(&self, ctx: &RequestContext) -> CounterKey {
        self.key.derive(&self.namespace, ctx)
    }

    /// Whether counting waits for the request's outcome.
    pub fn counts_outcome(&self) -> bool {
        self.count_predicate.is_some()
    }

    /// Whether a completed request counts against the quota.
    pub fn should_count(&self, ctx: &RequestContext, outcome: &Outcome) -> bool {
        self.count_predicate
            .as_ref()
            .map(|predicate| predicate(ctx, outcome))
            .unwrap_or(true)
    }

    /// Whether the request bypasses the limiter.
    pub fn should_skip(&self, ctx: &RequestContext) -> bool {
        self.skip.as_ref().map(|predicate| predicate(ctx)).unwrap_or(false)
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("key", &self.key)
            .field("counts_outcome", &self.counts_outcome())
            .field("has_skip", &self.skip.is_some())
            .field("rejection", &self.rejection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn ctx() -> RequestContext {
        RequestContext::new("192.0.2.1".parse().unwrap())
    }

    #[test]
    fn test_rejects_zero_window() {
        let err = assert_err!(Policy::new("strict", Duration::ZERO, 10));
        assert!(matches!(err, TurnstileError::Config(_)));
        assert!(err.to_string().contains("window"));
    }

    #[test]
    fn test_rejects_zero_max_requests() {
        let err = assert_err!(Policy::new("strict", Duration::from_secs(60), 0));
        assert!(err.to_string().contains("max_requests"));
    }

    #[test]
    fn test_from_rule() {
        let rule = LimitRule::new(900_000, 10);
        let policy = assert_ok!(Policy::from_rule("strict", &rule));

        assert_eq!(policy.window(), Duration::from_secs(900));
        assert_eq!(policy.max_requests(), 10);
        assert_eq!(policy.name(), "strict");
    }

    #[test]
    fn test_default_counts_everything() {
        let policy = Policy::new("moderate", Duration::from_secs(60), 100).unwrap();

        assert!(!policy.counts_outcome());
        assert!(policy.should_count(&ctx(), &Outcome::success()));
        assert!(policy.should_count(&ctx(), &Outcome::failure()));
        assert!(!policy.should_skip(&ctx()));
    }

    #[test]
    fn test_failures_only_predicate() {
        let policy = Policy::new("auth", Duration::from_secs(60), 5)
            .unwrap()
            .count_failures_only();

        assert!(policy.counts_outcome());
        assert!(!policy.should_count(&ctx(), &Outcome::success()));
        assert!(policy.should_count(&ctx(), &Outcome::failure()));
    }

    #[test]
    fn test_skip_when_output_supplied() {
        let policy = Policy::new("map", Duration::from_secs(3600), 120)
            .unwrap()
            .skip_when_output_supplied();

        assert!(!policy.should_skip(&ctx()));
        assert!(policy.should_skip(&ctx().with_supplied_output("https://cdn.example.com/m.png")));
    }

    #[test]
    fn test_namespace_defaults_to_name() {
        let policy = Policy::new("create", Duration::from_secs(60), 20).unwrap();
        assert_eq!(policy.key_for(&ctx()).to_store_key(), "create:ip:192.0.2.1");

        let policy = policy.with_namespace("posts:create").with_key(KeyStrategy::global());
        assert_eq!(policy.key_for(&ctx()).to_store_key(), "posts:create:const:global");
    }
}
