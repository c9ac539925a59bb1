//! Millrace Sandbox
//!
//! Isolated execution of tenant code strings with CPU/memory guards, an
//! allow/deny network policy, heartbeat supervision and secret redaction.
//! Two executors share one contract: a worker-thread executor and a
//! fresh-child-per-call process executor.

// error module
pub mod error;

// network policy
pub mod net;

// policy and tenancy overlay
pub mod policy;

// secret redaction
pub mod redact;

// script runtime
pub mod script;

// OS resource enforcement
pub mod limits;

// executors
pub mod executor;

// runner child protocol body
pub mod child;

// isolation watchdog
pub mod watchdog;

// supervisor
pub mod supervisor;

pub use error::{LimitedResource, SandboxError, SandboxResult};
pub use executor::{
    ExecutorResult, SandboxExecutor, SandboxFailure, SandboxInvocation, SandboxOutcome,
    process::ProcessExecutor, thread::ThreadExecutor,
};
pub use net::{
    AuditContext, HostRule, NetworkAccess, NetworkAuditRecord, NetworkAuditSink, NetworkDecision,
    NetworkRules, NullAuditSink,
};
pub use policy::{PolicyOverrides, ResourceLimits, SandboxPolicy, TenancyConfig};
pub use redact::{REDACTED, Redactor};
pub use script::ScriptLimits;
pub use supervisor::{SandboxRequest, SandboxSupervisor};
pub use watchdog::{IsolationWatchdog, ScopeKey, WatchdogConfig, WatchdogVerdict};
