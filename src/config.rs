//! Configuration management for Turnstile.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `TURNSTILE__`-prefixed environment variables
//! (e.g. `TURNSTILE__TIERS__STRICT__MAX_REQUESTS=20`).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{map_generation_policies, Tier};

const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

const FIFTEEN_MINUTES_MS: u64 = 15 * 60 * 1000;
const ONE_HOUR_MS: u64 = 60 * 60 * 1000;

/// Main configuration for the Turnstile engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Route tier limits
    #[serde(default)]
    pub tiers: TiersConfig,

    /// Map-generation guard limits
    #[serde(default)]
    pub map_generation: MapGenerationConfig,
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance
    #[default]
    Redis,
    /// Process-local memory; counters are not shared between instances
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Round-trip bound as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "rl".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

/// Window and cap for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum counted requests per window
    pub max_requests: u64,
}

impl LimitRule {
    /// Create a rule.
    pub const fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }

    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Limits for the route tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiersConfig {
    /// Sensitive endpoints (deletes)
    pub strict: LimitRule,
    /// Regular API endpoints
    pub moderate: LimitRule,
    /// Read-heavy endpoints
    pub lenient: LimitRule,
    /// Authentication attempts (failures only)
    pub auth: LimitRule,
    /// Content creation
    pub create: LimitRule,
    /// Whole-API ceiling
    pub global: LimitRule,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            strict: LimitRule::new(FIFTEEN_MINUTES_MS, 10),
            moderate: LimitRule::new(FIFTEEN_MINUTES_MS, 100),
            lenient: LimitRule::new(FIFTEEN_MINUTES_MS, 500),
            auth: LimitRule::new(FIFTEEN_MINUTES_MS, 5),
            create: LimitRule::new(ONE_HOUR_MS, 20),
            global: LimitRule::new(FIFTEEN_MINUTES_MS, 1000),
        }
    }
}

impl TiersConfig {
    /// Rule for a tier.
    pub fn rule(&self, tier: Tier) -> &LimitRule {
        match tier {
            Tier::Strict => &self.strict,
            Tier::Moderate => &self.moderate,
            Tier::Lenient => &self.lenient,
            Tier::Auth => &self.auth,
            Tier::Create => &self.create,
            Tier::Global => &self.global,
        }
    }
}

/// Limits for the map-generation guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapGenerationConfig {
    /// Per network origin
    pub ip: LimitRule,
    /// Per authenticated caller
    pub identity: LimitRule,
    /// Across every caller
    pub global: LimitRule,
}

impl Default for MapGenerationConfig {
    fn default() -> Self {
        Self {
            ip: LimitRule::new(ONE_HOUR_MS, 200),
            identity: LimitRule::new(ONE_HOUR_MS, 120),
            global: LimitRule::new(ONE_HOUR_MS, 2000),
        }
    }
}

impl TurnstileConfig {
    /// Load configuration from defaults, an optional YAML file and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&TurnstileConfig::default())?);

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            if !path.exists() {
                return Err(TurnstileError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let config: TurnstileConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string layered over the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = Config::builder()
            .add_source(Config::try_from(&TurnstileConfig::default())?)
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Check that every configured limiter forms a valid policy.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            tier.policy(&self.tiers)?;
        }
        map_generation_policies(&self.map_generation)?;
        if self.store.timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
