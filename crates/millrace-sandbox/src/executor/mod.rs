//! Sandbox executors
//!
//! Two executors, one contract: [`thread::ThreadExecutor`] runs the script
//! on a worker thread of this process; [`process::ProcessExecutor`] forks a
//! fresh child per call and enforces OS resource limits. The supervisor
//! picks one per the environment configuration.

pub mod process;
pub mod thread;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SandboxError;
use crate::net::NetworkAccess;
use crate::policy::SandboxPolicy;
use crate::script::ScriptLimits;

/// One sandbox call, with its effective policy already resolved.
#[derive(Debug, Clone)]
pub struct SandboxInvocation {
    pub code: String,
    pub entry_point: String,
    pub params: Value,
    pub context: Value,
    /// Wall-clock budget for the whole call.
    pub timeout: Duration,
    pub policy: SandboxPolicy,
    /// Secrets to scrub from logs and results, beyond what the redactor
    /// harvests from `params`/`context`.
    pub secrets: Vec<String>,
    /// Cooperative abort, composed by the caller from worker shutdown,
    /// node timeout and lease loss.
    pub abort: Arc<AtomicBool>,
}

/// What a successful sandbox call returns. Logs and result are already
/// redacted by the time this leaves the executor.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub result: Value,
    pub logs: Vec<String>,
    pub accesses: Vec<NetworkAccess>,
    pub duration_ms: u64,
}

/// A failed run plus whatever it observed before dying. Network accesses
/// ride on the failure so every allow/deny decision reaches the audit
/// sink no matter how the run ended.
#[derive(Debug, Clone)]
pub struct SandboxFailure {
    pub error: SandboxError,
    pub accesses: Vec<NetworkAccess>,
}

impl SandboxFailure {
    /// A failure with no observed accesses (setup errors, fail-fast paths).
    pub fn bare(error: SandboxError) -> Self {
        Self {
            error,
            accesses: Vec::new(),
        }
    }
}

impl From<SandboxError> for SandboxFailure {
    fn from(error: SandboxError) -> Self {
        Self::bare(error)
    }
}

/// Executor-boundary result: success or a failure carrying its accesses.
pub type ExecutorResult = Result<SandboxOutcome, SandboxFailure>;

/// Executor contract shared by the thread and process isolation models.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, invocation: SandboxInvocation) -> ExecutorResult;

    /// Tear down and replace any per-scope resources. Both built-in
    /// executors are per-call, so the default is a no-op.
    fn recycle(&self) {}

    /// Engine guard rails this executor applies to scripts.
    fn script_limits(&self) -> ScriptLimits {
        ScriptLimits::default()
    }
}
