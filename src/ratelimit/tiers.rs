//! Pre-built route tiers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::key::KeyStrategy;
use super::limiter::Limiter;
use super::metrics::Metrics;
use super::policy::Policy;
use super::rejection::RejectionTemplate;
use crate::config::TiersConfig;
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

/// Route tiers shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Sensitive endpoints such as deletes
    Strict,
    /// Regular API endpoints
    Moderate,
    /// Read-heavy endpoints
    Lenient,
    /// Authentication; only failed attempts count
    Auth,
    /// Content creation
    Create,
    /// One counter shared by every caller
    Global,
}

impl Tier {
    /// Every tier, in catalog order.
    pub const ALL: [Tier; 6] = [
        Tier::Strict,
        Tier::Moderate,
        Tier::Lenient,
        Tier::Auth,
        Tier::Create,
        Tier::Global,
    ];

    /// Tier name for logging and counter namespaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Strict => "strict",
            Tier::Moderate => "moderate",
            Tier::Lenient => "lenient",
            Tier::Auth => "auth",
            Tier::Create => "create",
            Tier::Global => "global",
        }
    }

    /// Key derivation the catalog uses for this tier.
    pub fn default_key_strategy(&self) -> KeyStrategy {
        match self {
            Tier::Global => KeyStrategy::global(),
            _ => KeyStrategy::IdentityOrIp,
        }
    }

    fn rejection(&self) -> RejectionTemplate {
        let message = match self {
            Tier::Strict => "Too many requests to a sensitive endpoint",
            Tier::Moderate | Tier::Lenient => "Too many requests",
            Tier::Auth => "Too many authentication attempts",
            Tier::Create => "Too many items created",
            Tier::Global => "The service is receiving too many requests",
        };
        RejectionTemplate::new("RATE_LIMIT_EXCEEDED", message)
    }

    /// Build this tier's policy from configuration.
    pub fn policy(&self, config: &TiersConfig) -> Result<Policy> {
        let policy = Policy::from_rule(self.as_str(), config.rule(*self))?
            .with_key(self.default_key_strategy())
            .with_rejection(self.rejection());

        Ok(match self {
            Tier::Auth => policy.count_failures_only(),
            _ => policy,
        })
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TurnstileError::Config(format!("unknown tier '{}'", s)))
    }
}

/// Limiters for every route tier, sharing one store and one set of metrics.
///
/// Store failures admit requests (fail open): a degraded counter store
/// weakens rate limiting but never rejects traffic on its own.
#[derive(Clone)]
pub struct TierCatalog {
    config: TiersConfig,
    store: Arc<dyn CounterStore>,
    store_timeout: Duration,
    metrics: Metrics,
    strict: Limiter,
    moderate: Limiter,
    lenient: Limiter,
    auth: Limiter,
    create: Limiter,
    global: Limiter,
}

impl TierCatalog {
    /// Build the catalog.
    ///
    /// # Errors
    /// Returns [`TurnstileError::Config`] if any tier is misconfigured.
    pub fn new(
        config: &TiersConfig,
        store: Arc<dyn CounterStore>,
        store_timeout: Duration,
    ) -> Result<Self> {
        let metrics = Metrics::new();
        let build = |tier: Tier| -> Result<Limiter> {
            Ok(Limiter::new(tier.policy(config)?, Arc::clone(&store))
                .with_store_timeout(store_timeout)
                .with_metrics(metrics.clone()))
        };

        let catalog = Self {
            strict: build(Tier::Strict)?,
            moderate: build(Tier::Moderate)?,
            lenient: build(Tier::Lenient)?,
            auth: build(Tier::Auth)?,
            create: build(Tier::Create)?,
            global: build(Tier::Global)?,
            config: config.clone(),
            store: Arc::clone(&store),
            store_timeout,
            metrics: metrics.clone(),
        };

        info!(
            strict = config.strict.max_requests,
            moderate = config.moderate.max_requests,
            lenient = config.lenient.max_requests,
            auth = config.auth.max_requests,
            create = config.create.max_requests,
            global = config.global.max_requests,
            "Tier catalog initialized"
        );
        Ok(catalog)
    }

    /// The limiter for `tier`.
    pub fn get(&self, tier: Tier) -> &Limiter {
        match tier {
            Tier::Strict => &self.strict,
            Tier::Moderate => &self.moderate,
            Tier::Lenient => &self.lenient,
            Tier::Auth => &self.auth,
            Tier::Create => &self.create,
            Tier::Global => &self.global,
        }
    }

    pub fn strict(&self) -> &Limiter {
        &self.strict
    }

    pub fn moderate(&self) -> &Limiter {
        &self.moderate
    }

    pub fn lenient(&self) -> &Limiter {
        &self.lenient
    }

    pub fn auth(&self) -> &Limiter {
        &self.auth
    }

    pub fn create(&self) -> &Limiter {
        &self.create
    }

    pub fn global(&self) -> &Limiter {
        &self.global
    }

    /// A limiter for `tier` keyed by an integrator-chosen strategy.
    ///
    /// Its counters live in their own namespace
    /// (`{tier}:{scope}:{key}`) so they never mix with the default
    /// limiter's.
    pub fn limiter_with_key(&self, tier: Tier, key: KeyStrategy) -> Result<Limiter> {
        Ok(Limiter::new(tier.policy(&self.config)?.with_key(key), Arc::clone(&self.store))
            .with_store_timeout(self.store_timeout)
            .with_metrics(self.metrics.clone()))
    }

    /// Metrics shared by every limiter in the catalog.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl fmt::Debug for TierCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierCatalog")
            .field("config", &self.config)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitRule;
    use crate::ratelimit::context::{Outcome, RequestContext};
    use crate::store::MemoryCounterStore;

    fn catalog(config: &TiersConfig) -> (TierCatalog, Arc<MemoryCounterStore>) {
        let store = Arc::new(MemoryCounterStore::new());
        let catalog = TierCatalog::new(config, store.clone(), Duration::from_millis(100)).unwrap();
        (catalog, store)
    }

    fn ctx(ip: &str) -> RequestContext {
        RequestContext::new(ip.parse().unwrap())
    }

    #[test]
    fn test_tier_names_round_trip() {
        for tier in Tier::ALL {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert_eq!("STRICT".parse::<Tier>().unwrap(), Tier::Strict);
        assert!("premium".parse::<Tier>().is_err());
    }

    #[test]
    fn test_default_policies_follow_table() {
        let config = TiersConfig::default();
        let expected = [
            (Tier::Strict, 900, 10),
            (Tier::Moderate, 900, 100),
            (Tier::Lenient, 900, 500),
            (Tier::Auth, 900, 5),
            (Tier::Create, 3600, 20),
            (Tier::Global, 900, 1000),
        ];

        for (tier, window_secs, max) in expected {
            let policy = tier.policy(&config).unwrap();
            assert_eq!(policy.window(), Duration::from_secs(window_secs), "{}", tier);
            assert_eq!(policy.max_requests(), max, "{}", tier);
            assert_eq!(policy.counts_outcome(), tier == Tier::Auth, "{}", tier);
        }
    }

    #[test]
    fn test_misconfigured_tier_fails_catalog_build() {
        let config = TiersConfig {
            create: LimitRule::new(3_600_000, 0),
            ..Default::default()
        };
        let store = Arc::new(MemoryCounterStore::new());
        let err = TierCatalog::new(&config, store, Duration::from_millis(100)).unwrap_err();
        assert!(err.to_string().contains("create"));
    }

    #[tokio::test]
    async fn test_strict_tier_caps_per_caller() {
        let config = TiersConfig {
            strict: LimitRule::new(900_000, 2),
            ..Default::default()
        };
        let (catalog, _store) = catalog(&config);
        let alice = ctx("10.0.0.1").with_identity("alice");
        let bob = ctx("10.0.0.1").with_identity("bob");

        assert!(catalog.strict().evaluate(&alice).await.allowed);
        assert!(catalog.strict().evaluate(&alice).await.allowed);
        assert!(!catalog.strict().evaluate(&alice).await.allowed);
        assert!(catalog.strict().evaluate(&bob).await.allowed);
    }

    #[tokio::test]
    async fn test_global_tier_shares_one_counter() {
        let config = TiersConfig {
            global: LimitRule::new(900_000, 2),
            ..Default::default()
        };
        let (catalog, store) = catalog(&config);

        assert!(catalog.global().evaluate(&ctx("10.0.0.1")).await.allowed);
        assert!(catalog.global().evaluate(&ctx("10.0.0.2")).await.allowed);
        assert!(!catalog.global().evaluate(&ctx("10.0.0.3")).await.allowed);
        assert_eq!(store.count("global:const:global"), 3);
    }

    #[tokio::test]
    async fn test_auth_tier_trips_on_failures_only() {
        let (catalog, _store) = catalog(&TiersConfig::default());
        let limiter = catalog.get(Tier::Auth);
        let request = ctx("10.0.0.9");

        for _ in 0..10 {
            let admission = limiter.precheck(&request).await;
            assert!(admission.is_allowed());
            limiter.record(&request, &admission, &Outcome::success()).await;
        }
        for _ in 0..5 {
            let admission = limiter.precheck(&request).await;
            assert!(admission.is_allowed());
            limiter.record(&request, &admission, &Outcome::failure()).await;
        }

        let refused = limiter.precheck(&request).await;
        let decision = refused.decision();
        assert!(!decision.allowed);
        let rejection = limiter.rejection(decision);
        assert!(rejection.message.starts_with("Too many authentication attempts (6/5)"));
    }

    #[tokio::test]
    async fn test_tiers_do_not_share_counters() {
        let (catalog, _store) = catalog(&TiersConfig {
            strict: LimitRule::new(900_000, 1),
            ..Default::default()
        });
        let request = ctx("10.0.0.1");

        assert!(catalog.strict().evaluate(&request).await.allowed);
        assert!(catalog.moderate().evaluate(&request).await.allowed);
        assert!(!catalog.strict().evaluate(&request).await.allowed);
    }

    #[tokio::test]
    async fn test_custom_key_limiter_is_independent() {
        let (catalog, store) = catalog(&TiersConfig {
            create: LimitRule::new(3_600_000, 1),
            ..Default::default()
        });
        let by_route = catalog
            .limiter_with_key(Tier::Create, KeyStrategy::custom("route", |c| {
                c.path.clone().unwrap_or_default()
            }))
            .unwrap();
        let request = ctx("10.0.0.1").with_path("/posts");

        assert!(catalog.create().evaluate(&request).await.allowed);
        assert!(by_route.evaluate(&request).await.allowed);
        assert_eq!(store.count("create:route:/posts"), 1);
        assert_eq!(store.count("create:ip:10.0.0.1"), 1);
    }

    #[tokio::test]
    async fn test_catalog_metrics_are_shared() {
        let (catalog, _store) = catalog(&TiersConfig::default());
        let request = ctx("10.0.0.1");

        catalog.strict().evaluate(&request).await;
        catalog.lenient().evaluate(&request).await;

        assert_eq!(catalog.metrics().snapshot().allowed, 2);
    }
}
