//! Counter key derivation.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::context::RequestContext;

/// Derives the counting key for a request.
#[derive(Clone)]
pub enum KeyStrategy {
    /// One counter per network origin.
    Ip,
    /// One counter per authenticated caller, falling back to the network
    /// origin for anonymous requests.
    IdentityOrIp,
    /// A single counter shared by every caller.
    Constant(String),
    /// Integrator-supplied derivation. `scope` names the key namespace so
    /// custom keys never collide with the built-in scopes.
    Custom {
        scope: String,
        derive: Arc<dyn Fn(&RequestContext) -> String + Send + Sync>,
    },
}

impl KeyStrategy {
    /// A single key shared by every caller.
    pub fn global() -> Self {
        KeyStrategy::Constant("global".to_string())
    }

    /// Build a custom strategy.
    pub fn custom<F>(scope: impl Into<String>, derive: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        KeyStrategy::Custom {
            scope: scope.into(),
            derive: Arc::new(derive),
        }
    }

    /// Derive the key for `ctx` inside `namespace`.
    pub fn derive(&self, namespace: &str, ctx: &RequestContext) -> CounterKey {
        let (scope, value, sensitive) = match self {
            KeyStrategy::Ip => ("ip".to_string(), ctx.ip.to_string(), true),
            KeyStrategy::IdentityOrIp => match ctx.identity() {
                Some(identity) => ("user".to_string(), identity.to_string(), true),
                None => ("ip".to_string(), ctx.ip.to_string(), true),
            },
            KeyStrategy::Constant(value) => ("const".to_string(), value.clone(), false),
            KeyStrategy::Custom { scope, derive } => (scope.clone(), derive(ctx), true),
        };

        CounterKey {
            namespace: namespace.to_string(),
            scope,
            value,
            sensitive,
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Ip => write!(f, "Ip"),
            KeyStrategy::IdentityOrIp => write!(f, "IdentityOrIp"),
            KeyStrategy::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            KeyStrategy::Custom { scope, .. } => {
                f.debug_struct("Custom").field("scope", scope).finish_non_exhaustive()
            }
        }
    }
}

/// A key that uniquely identifies one counter in the store.
///
/// Rendered as `{namespace}:{scope}:{value}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Policy namespace (e.g. `strict`, `map:ip`)
    pub namespace: String,
    /// Key scope (`ip`, `user`, `const` or a custom scope)
    pub scope: String,
    /// Derived value within the scope
    pub value: String,
    /// Whether the value identifies a caller and must not be logged verbatim
    pub sensitive: bool,
}

impl CounterKey {
    /// The full store key.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.scope, self.value)
    }

    /// Form of the key that is safe to put in logs.
    ///
    /// Caller-identifying values are replaced by a stable hash.
    pub fn redacted(&self) -> String {
        if !self.sensitive {
            return self.to_store_key();
        }
        let mut hasher = DefaultHasher::new();
        self.value.hash(&mut hasher);
        format!("{}:{}:#{:016x}", self.namespace, self.scope, hasher.finish())
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

/// Blast radius guarded by one stage of a composite controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Per network origin
    Ip,
    /// Per authenticated caller
    Identity,
    /// Across all callers
    Global,
}

impl Scope {
    /// Scope name for logging and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::Identity => "identity",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("198.51.100.4".parse().unwrap())
    }

    #[test]
    fn test_ip_key() {
        let key = KeyStrategy::Ip.derive("strict", &ctx());
        assert_eq!(key.to_store_key(), "strict:ip:198.51.100.4");
    }

    #[test]
    fn test_identity_falls_back_to_ip() {
        let anonymous = KeyStrategy::IdentityOrIp.derive("moderate", &ctx());
        assert_eq!(anonymous.to_store_key(), "moderate:ip:198.51.100.4");

        let known = KeyStrategy::IdentityOrIp.derive("moderate", &ctx().with_identity("u-42"));
        assert_eq!(known.to_store_key(), "moderate:user:u-42");
    }

    #[test]
    fn test_strategies_use_distinct_namespaces() {
        let request = ctx();
        let by_ip = KeyStrategy::Ip.derive("create", &request);
        let global = KeyStrategy::global().derive("create", &request);
        let custom = KeyStrategy::custom("route", |c| c.ip.to_string()).derive("create", &request);

        assert_ne!(by_ip.to_store_key(), global.to_store_key());
        assert_ne!(by_ip.to_store_key(), custom.to_store_key());
        assert_eq!(custom.to_store_key(), "create:route:198.51.100.4");
    }

    #[test]
    fn test_redaction_hides_caller_values() {
        let key = KeyStrategy::IdentityOrIp.derive("auth", &ctx().with_identity("alice@example.com"));
        let redacted = key.redacted();

        assert!(redacted.starts_with("auth:user:#"));
        assert!(!redacted.contains("alice"));
        assert_eq!(redacted, key.redacted());
    }

    #[test]
    fn test_constant_keys_are_logged_verbatim() {
        let key = KeyStrategy::global().derive("global", &ctx());
        assert_eq!(key.to_string(), "global:const:global");
    }

    #[test]
    fn test_scope_names() {
        assert_eq!(Scope::Ip.as_str(), "ip");
        assert_eq!(Scope::Identity.to_string(), "identity");
        assert_eq!(serde_json::to_string(&Scope::Global).unwrap(), "\"global\"");
    }
}
