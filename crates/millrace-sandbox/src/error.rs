//! Sandbox error types

use millrace_kernel::{EngineError, ErrorCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which resource limit was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitedResource {
    Cpu,
    Memory,
}

impl std::fmt::Display for LimitedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitedResource::Cpu => write!(f, "cpu"),
            LimitedResource::Memory => write!(f, "memory"),
        }
    }
}

/// Sandbox execution result type.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Everything that can go wrong running tenant code.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum SandboxError {
    /// Entry-point call exceeded its budget
    #[error("sandbox timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    Timeout { elapsed_ms: u64, budget_ms: u64 },

    /// Caller aborted the call (lease loss, worker shutdown, node timeout)
    #[error("sandbox call aborted")]
    Abort,

    #[error("resource limit exceeded: {resource} used {usage} of {limit}")]
    ResourceLimit {
        resource: LimitedResource,
        usage: u64,
        limit: u64,
    },

    /// `fetch` refused by the network policy
    #[error("network denied for host {host}: {reason}")]
    NetworkDenied { host: String, reason: String },

    /// Child stopped making progress
    #[error("sandbox heartbeat timed out after {stale_ms}ms")]
    HeartbeatTimeout { stale_ms: u64 },

    /// Scope quarantined or another policy rule violated
    #[error("sandbox policy violation: {0}")]
    PolicyViolation(String),

    /// Tenant code failed to compile or has no entry point
    #[error("script compile error: {0}")]
    Compile(String),

    /// Tenant code raised a runtime error of its own
    #[error("script error: {0}")]
    Script(String),

    #[error("sandbox internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// The stable engine code this error surfaces as.
    pub fn code(&self) -> ErrorCode {
        match self {
            SandboxError::Timeout { .. } => ErrorCode::SandboxTimeout,
            SandboxError::Abort => ErrorCode::SandboxAbort,
            SandboxError::ResourceLimit { .. } => ErrorCode::SandboxResourceLimit,
            SandboxError::NetworkDenied { .. } => ErrorCode::SandboxNetworkPolicy,
            SandboxError::HeartbeatTimeout { .. } => ErrorCode::SandboxHeartbeatTimeout,
            SandboxError::PolicyViolation(_) => ErrorCode::SandboxPolicyViolation,
            SandboxError::Compile(_) | SandboxError::Script(_) | SandboxError::Internal(_) => {
                ErrorCode::SandboxPolicyViolation
            }
        }
    }

    /// Violations the isolation watchdog counts against the scope.
    pub fn is_isolation_violation(&self) -> bool {
        matches!(
            self,
            SandboxError::ResourceLimit { .. }
                | SandboxError::NetworkDenied { .. }
                | SandboxError::HeartbeatTimeout { .. }
                | SandboxError::PolicyViolation(_)
        )
    }
}

impl From<SandboxError> for EngineError {
    fn from(err: SandboxError) -> Self {
        let code = err.code();
        match err {
            // Plain script failures keep their message and classify like any
            // foreign error so transient causes stay retryable.
            SandboxError::Script(message) => EngineError::Other(message),
            other => EngineError::SandboxViolation {
                code,
                message: other.to_string(),
            },
        }
    }
}
