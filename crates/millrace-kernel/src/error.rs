//! Engine error taxonomy
//!
//! Every failure that crosses a component boundary carries a stable
//! [`ErrorCode`]. Retry decisions are made on the code, never on the
//! message; message classification exists only as a fallback for errors
//! raised by foreign code (connector SDKs, tenant scripts).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine operation result type.
pub type EngineResult<T> = Result<T, EngineError>;

/// Stable error codes surfaced in execution metadata and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    RateLimit,
    NetworkError,
    ServiceUnavailable,
    ServerError,
    UnknownError,
    CircuitOpen,
    SandboxTimeout,
    SandboxAbort,
    SandboxResourceLimit,
    SandboxNetworkPolicy,
    SandboxHeartbeatTimeout,
    SandboxPolicyViolation,
    QuotaConcurrency,
    QuotaRate,
    QuotaUsage,
    ConnectorConcurrency,
    Dlq,
    RegionMismatch,
    LeaseLost,
    Internal,
}

impl ErrorCode {
    /// Transient classes the retry manager is allowed to absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::RateLimit
                | ErrorCode::NetworkError
                | ErrorCode::ServiceUnavailable
                | ErrorCode::ServerError
        )
    }

    /// Sandbox policy and resource violations are terminal for the node.
    pub fn is_sandbox_violation(&self) -> bool {
        matches!(
            self,
            ErrorCode::SandboxResourceLimit
                | ErrorCode::SandboxNetworkPolicy
                | ErrorCode::SandboxPolicyViolation
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::SandboxTimeout => "SANDBOX_TIMEOUT",
            ErrorCode::SandboxAbort => "SANDBOX_ABORT",
            ErrorCode::SandboxResourceLimit => "SANDBOX_RESOURCE_LIMIT",
            ErrorCode::SandboxNetworkPolicy => "SANDBOX_NETWORK_POLICY",
            ErrorCode::SandboxHeartbeatTimeout => "SANDBOX_HEARTBEAT_TIMEOUT",
            ErrorCode::SandboxPolicyViolation => "SANDBOX_POLICY_VIOLATION",
            ErrorCode::QuotaConcurrency => "QUOTA_CONCURRENCY",
            ErrorCode::QuotaRate => "QUOTA_RATE",
            ErrorCode::QuotaUsage => "QUOTA_USAGE",
            ErrorCode::ConnectorConcurrency => "CONNECTOR_CONCURRENCY",
            ErrorCode::Dlq => "DLQ",
            ErrorCode::RegionMismatch => "REGION_MISMATCH",
            ErrorCode::LeaseLost => "LEASE_LOST",
            ErrorCode::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

/// Classify a foreign error message into a transient class.
///
/// Matching is case- and whitespace-insensitive. Structured codes carried
/// by [`EngineError`] always take precedence over this; it exists for
/// errors that arrive as bare strings.
pub fn classify_message(message: &str) -> ErrorCode {
    let msg = message.trim().to_ascii_lowercase();

    const TIMEOUT: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];
    const RATE_LIMIT: &[&str] = &["rate limit", "too many requests", "429", "quota exceeded"];
    const NETWORK: &[&str] = &[
        "econnrefused",
        "econnreset",
        "enotfound",
        "ehostunreach",
        "socket hang up",
        "network error",
        "connection refused",
        "connection reset",
        "dns",
    ];
    const UNAVAILABLE: &[&str] = &["service unavailable", "503", "temporarily unavailable"];
    const SERVER: &[&str] = &[
        "internal server error",
        "bad gateway",
        "gateway timeout",
        "500",
        "502",
        "504",
    ];

    let matches_any = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if matches_any(TIMEOUT) {
        ErrorCode::Timeout
    } else if matches_any(RATE_LIMIT) {
        ErrorCode::RateLimit
    } else if matches_any(NETWORK) {
        ErrorCode::NetworkError
    } else if matches_any(UNAVAILABLE) {
        ErrorCode::ServiceUnavailable
    } else if matches_any(SERVER) {
        ErrorCode::ServerError
    } else {
        ErrorCode::UnknownError
    }
}

/// Engine error type.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Node operation exceeded its deadline
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Upstream rate limiting
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Upstream 5xx
    #[error("Server error: {0}")]
    Server(String),

    /// Circuit breaker short-circuited the call
    #[error(
        "Circuit open for {connector_id}/{node_id} after {consecutive_failures} consecutive failures"
    )]
    CircuitOpen {
        connector_id: String,
        node_id: String,
        consecutive_failures: u32,
    },

    /// Sandbox policy or resource violation; `code` is one of the SANDBOX_* codes
    #[error("Sandbox violation ({code}): {message}")]
    SandboxViolation { code: ErrorCode, message: String },

    /// Tenant is at its concurrent-execution limit
    #[error("Execution quota exceeded for {organization_id}: {running} of {limit} running")]
    ConcurrencyQuotaExceeded {
        organization_id: String,
        running: u32,
        limit: u32,
    },

    /// Tenant exhausted its sliding rate window
    #[error("Execution rate exceeded for {organization_id}: {window_count} of {limit} per minute")]
    RateQuotaExceeded {
        organization_id: String,
        window_count: u32,
        limit: u32,
    },

    /// Plan-level usage quota verdict from the billing service
    #[error("Usage quota exceeded for {organization_id}: {reason}")]
    UsageQuotaExceeded {
        organization_id: String,
        reason: String,
    },

    /// A connector in the workflow is at its per-scope concurrency limit
    #[error("Connector {connector_id} is at its concurrency limit ({limit})")]
    ConnectorConcurrencyExceeded { connector_id: String, limit: u32 },

    /// Node attempt exhausted its retry budget without a retryable class
    #[error("Dead-lettered: {0}")]
    DeadLettered(String),

    /// The worker lost its lease; another worker owns the execution now
    #[error("Lease lost for execution {execution_id}")]
    LeaseLost { execution_id: String },

    #[error("Region mismatch: job is {expected}, worker is {actual}")]
    RegionMismatch { expected: String, actual: String },

    /// User-visible node failure wrapper
    #[error("Node \"{label}\" failed: {message}")]
    NodeFailed {
        label: String,
        code: ErrorCode,
        message: String,
    },

    #[error("Workflow invalid: {0}")]
    InvalidWorkflow(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Foreign error carried as a string; classified on demand
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Timeout { .. } => ErrorCode::Timeout,
            EngineError::RateLimited(_) => ErrorCode::RateLimit,
            EngineError::Network(_) => ErrorCode::NetworkError,
            EngineError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            EngineError::Server(_) => ErrorCode::ServerError,
            EngineError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            EngineError::SandboxViolation { code, .. } => *code,
            EngineError::ConcurrencyQuotaExceeded { .. } => ErrorCode::QuotaConcurrency,
            EngineError::RateQuotaExceeded { .. } => ErrorCode::QuotaRate,
            EngineError::UsageQuotaExceeded { .. } => ErrorCode::QuotaUsage,
            EngineError::ConnectorConcurrencyExceeded { .. } => ErrorCode::ConnectorConcurrency,
            EngineError::DeadLettered(_) => ErrorCode::Dlq,
            EngineError::LeaseLost { .. } => ErrorCode::LeaseLost,
            EngineError::RegionMismatch { .. } => ErrorCode::RegionMismatch,
            EngineError::NodeFailed { code, .. } => *code,
            EngineError::InvalidWorkflow(_)
            | EngineError::Store(_)
            | EngineError::Queue(_)
            | EngineError::Serialization(_)
            | EngineError::Internal(_) => ErrorCode::Internal,
            EngineError::Other(msg) => classify_message(msg),
        }
    }

    /// Whether the retry manager may absorb this error.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Whether this error must never be retried, regardless of policy.
    pub fn is_fatal_for_node(&self) -> bool {
        self.code().is_sandbox_violation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_case_and_whitespace_insensitive() {
        assert_eq!(classify_message("Timeout"), ErrorCode::Timeout);
        assert_eq!(classify_message("  TIMEOUT  "), ErrorCode::Timeout);
        assert_eq!(classify_message("timeout after 1s"), ErrorCode::Timeout);
    }

    #[test]
    fn classify_network_errors() {
        assert_eq!(classify_message("ECONNREFUSED"), ErrorCode::NetworkError);
        assert_eq!(
            classify_message("connect ECONNRESET 10.0.0.1:443"),
            ErrorCode::NetworkError
        );
    }

    #[test]
    fn classify_falls_back_to_unknown() {
        assert_eq!(classify_message("segfault"), ErrorCode::UnknownError);
        assert_eq!(classify_message(""), ErrorCode::UnknownError);
    }

    #[test]
    fn retryable_split() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::RateLimit.is_retryable());
        assert!(ErrorCode::ServerError.is_retryable());
        assert!(!ErrorCode::CircuitOpen.is_retryable());
        assert!(!ErrorCode::SandboxResourceLimit.is_retryable());
        assert!(!ErrorCode::QuotaUsage.is_retryable());
    }

    #[test]
    fn sandbox_violation_is_fatal() {
        let err = EngineError::SandboxViolation {
            code: ErrorCode::SandboxNetworkPolicy,
            message: "host_not_allowlisted".into(),
        };
        assert!(err.is_fatal_for_node());
        assert!(!err.is_retryable());

        let timeout = EngineError::SandboxViolation {
            code: ErrorCode::SandboxTimeout,
            message: "exceeded 30s".into(),
        };
        assert!(!timeout.is_fatal_for_node());
    }

    #[test]
    fn other_errors_classify_their_message() {
        let err = EngineError::Other("upstream said 503 Service Unavailable".into());
        assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
        assert!(err.is_retryable());
    }
}
