//! Rejection payloads surfaced to callers on denial.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use super::decision::{ceil_secs, Decision};
use super::key::Scope;

/// HTTP status for "slow down and try again later".
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// HTTP status for "the whole system is over budget".
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// How a policy describes its rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionTemplate {
    /// Machine-readable rejection code
    pub code: String,
    /// Leading human-readable sentence
    pub message: String,
    /// Status the caller should respond with
    pub status: u16,
}

impl RejectionTemplate {
    /// Create a template answering with 429.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: STATUS_TOO_MANY_REQUESTS,
        }
    }

    /// Override the response status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

impl Default for RejectionTemplate {
    fn default() -> Self {
        Self::new("RATE_LIMIT_EXCEEDED", "Too many requests")
    }
}

/// Structured rejection for a denied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    /// Status the caller should respond with
    #[serde(skip)]
    pub status: u16,
    /// Machine-readable rejection code
    pub code: String,
    /// Human-readable explanation including the wait
    pub message: String,
    /// Name of the policy that denied
    pub tier: String,
    /// Composite scope that denied, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    /// Configured limit
    pub limit: u64,
    /// Observed count
    pub current: u64,
    /// Remaining quota (always zero on denial)
    pub remaining: u64,
    /// When the window resets
    pub reset_time: DateTime<Utc>,
    /// Human-readable wait, e.g. "3 minutes"
    pub retry_after: String,
    /// Wait in whole seconds
    pub retry_after_secs: u64,
}

impl Rejection {
    /// Render a rejection for `decision` using `template`.
    pub fn new(template: &RejectionTemplate, tier: &str, decision: &Decision) -> Self {
        let wait = decision.retry_after.unwrap_or(Duration::ZERO);
        let retry_after = retry_after_text(wait);
        let message = format!(
            "{} ({}/{}). Please try again in {}.",
            template.message.trim_end_matches('.'),
            decision.current,
            decision.limit,
            retry_after
        );

        Self {
            status: template.status,
            code: template.code.clone(),
            message,
            tier: tier.to_string(),
            scope: None,
            limit: decision.limit,
            current: decision.current,
            remaining: decision.remaining,
            reset_time: decision.reset_at,
            retry_after,
            retry_after_secs: ceil_secs(wait),
        }
    }

    /// Annotate with the composite scope that denied.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// JSON response body: `{"success": false, "error": {...}}`.
    pub fn to_body(&self) -> serde_json::Value {
        json!({
            "success": false,
            "error": self,
        })
    }
}

/// Wait rounded up to whole minutes, never less than one.
pub fn retry_after_text(wait: Duration) -> String {
    let minutes = ceil_secs(wait).div_ceil(60).max(1);
    if minutes == 1 {
        "1 minute".to_string()
    } else {
        format!("{} minutes", minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CounterSnapshot;

    fn denied(limit: u64, count: u64, ttl: Duration) -> Decision {
        Decision::counted(limit, CounterSnapshot { count, ttl }, Utc::now())
    }

    #[test]
    fn test_retry_after_text() {
        assert_eq!(retry_after_text(Duration::ZERO), "1 minute");
        assert_eq!(retry_after_text(Duration::from_secs(59)), "1 minute");
        assert_eq!(retry_after_text(Duration::from_secs(61)), "2 minutes");
        assert_eq!(retry_after_text(Duration::from_secs(15 * 60)), "15 minutes");
    }

    #[test]
    fn test_rejection_message_and_fields() {
        let decision = denied(10, 11, Duration::from_secs(170));
        let rejection = Rejection::new(&RejectionTemplate::default(), "strict", &decision);

        assert_eq!(rejection.status, STATUS_TOO_MANY_REQUESTS);
        assert_eq!(rejection.code, "RATE_LIMIT_EXCEEDED");
        assert_eq!(
            rejection.message,
            "Too many requests (11/10). Please try again in 3 minutes."
        );
        assert_eq!(rejection.limit, 10);
        assert_eq!(rejection.retry_after_secs, 170);
    }

    #[test]
    fn test_rejection_body_shape() {
        let template = RejectionTemplate::new("GLOBAL_MAP_LIMIT", "The system is experiencing high demand")
            .with_status(STATUS_SERVICE_UNAVAILABLE);
        let decision = denied(2000, 2001, Duration::from_secs(600));
        let rejection = Rejection::new(&template, "map:global", &decision).with_scope(Scope::Global);

        let body = rejection.to_body();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "GLOBAL_MAP_LIMIT");
        assert_eq!(body["error"]["scope"], "global");
        assert_eq!(body["error"]["limit"], 2000);
        assert_eq!(body["error"]["retryAfter"], "10 minutes");
        assert!(body["error"].get("status").is_none());
        assert_eq!(rejection.status, 503);
    }

    #[test]
    fn test_scope_omitted_for_plain_tiers() {
        let decision = denied(5, 6, Duration::from_secs(60));
        let rejection = Rejection::new(&RejectionTemplate::default(), "auth", &decision);
        assert!(rejection.to_body()["error"].get("scope").is_none());
    }
}
