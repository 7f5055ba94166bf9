//! Rate limiting logic: policies, limiters, route tiers and the
//! multi-scope composite controller.

mod composite;
mod context;
mod decision;
mod key;
mod limiter;
mod metrics;
mod policy;
mod rejection;
mod tiers;

pub use composite::{
    map_generation_policies, CompositeController, CompositeOutcome, CompositeState, StageRecord,
};
pub use context::{Outcome, RequestContext};
pub use decision::{Decision, DecisionSource};
pub use key::{CounterKey, KeyStrategy, Scope};
pub use limiter::{Admission, Limiter, DEFAULT_STORE_TIMEOUT};
pub use metrics::{Metrics, MetricsSnapshot};
pub use policy::{CountPredicate, Policy, SkipPredicate};
pub use rejection::{
    retry_after_text, Rejection, RejectionTemplate, STATUS_SERVICE_UNAVAILABLE,
    STATUS_TOO_MANY_REQUESTS,
};
pub use tiers::{Tier, TierCatalog};
