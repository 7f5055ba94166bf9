//! Per-request inputs to admission decisions.

use std::net::IpAddr;

/// What the limiter knows about an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Network origin of the caller.
    pub ip: IpAddr,
    /// Authenticated caller identity, when the request carries one.
    pub identity: Option<String>,
    /// Route being accessed, used only for diagnostics.
    pub path: Option<String>,
    /// A result the caller already holds for the metered resource (for
    /// example a previously rendered map image URL). Requests carrying one
    /// trigger no new billable work.
    pub supplied_output: Option<String>,
}

impl RequestContext {
    /// Create a context for an anonymous request from `ip`.
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            identity: None,
            path: None,
            supplied_output: None,
        }
    }

    /// Attach the authenticated caller identity.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Attach the route being accessed.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach a previously computed output for the metered resource.
    pub fn with_supplied_output(mut self, output: impl Into<String>) -> Self {
        self.supplied_output = Some(output.into());
        self
    }

    /// Identity, ignoring empty strings.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref().filter(|id| !id.is_empty())
    }

    /// Whether the caller already holds a usable output.
    pub fn has_supplied_output(&self) -> bool {
        self.supplied_output
            .as_deref()
            .map(|output| !output.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Result of the guarded operation, used by outcome-counted policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// HTTP-style status code reported by the guarded operation.
    pub status: u16,
}

impl Outcome {
    /// An outcome with the given status.
    pub fn new(status: u16) -> Self {
        Self { status }
    }

    /// A successful (200) outcome.
    pub fn success() -> Self {
        Self::new(200)
    }

    /// A failed (401) outcome.
    pub fn failure() -> Self {
        Self::new(401)
    }

    /// Whether the operation failed. Any status of 400 or above counts.
    pub fn is_failure(&self) -> bool {
        self.status >= 400
    }
}
