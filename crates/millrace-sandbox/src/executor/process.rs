//! Subprocess executor
//!
//! The production isolation model: a fresh runner child per call. The
//! payload travels over stdin as one JSON document; the child streams
//! newline-delimited frames (heartbeats, then exactly one terminal frame)
//! back over stdout. OS limits come from a per-execution cgroup when a
//! root is configured, rlimits applied by the child otherwise, with 200ms
//! parent-side usage polling as the backstop.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{ExecutorResult, SandboxExecutor, SandboxFailure, SandboxInvocation, SandboxOutcome};
use crate::error::{LimitedResource, SandboxError, SandboxResult};
use crate::limits::{CgroupScope, sample_proc_usage};
use crate::net::{NetworkAccess, NetworkRules};
use crate::redact::Redactor;
use crate::script::ScriptLimits;

/// Usage polling cadence.
const USAGE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grace period between asking a child to stop and killing it.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Everything the runner child needs, shipped over stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRequest {
    pub code: String,
    pub entry_point: String,
    pub params: Value,
    pub context: Value,
    pub call_budget_ms: u64,
    pub compile_budget_ms: u64,
    pub max_cpu_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    /// False when the parent put the child in a cgroup instead.
    pub apply_rlimits: bool,
    pub heartbeat_interval_ms: u64,
    pub network: NetworkRules,
    pub secrets: Vec<String>,
    pub limits: ScriptLimits,
}

/// One stdout line from the child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ChildFrame {
    Heartbeat {
        at_ms: i64,
    },
    /// One network decision, streamed as it happens so the parent keeps
    /// an audit trail even when the child dies before its terminal frame.
    Access {
        access: NetworkAccess,
    },
    Done {
        result: Value,
        logs: Vec<String>,
        accesses: Vec<NetworkAccess>,
        duration_ms: u64,
    },
    Failed {
        error: SandboxError,
        logs: Vec<String>,
        accesses: Vec<NetworkAccess>,
    },
}

/// Fresh-child-per-call executor.
pub struct ProcessExecutor {
    runner: PathBuf,
    limits: ScriptLimits,
}

impl ProcessExecutor {
    pub fn new(runner: PathBuf, limits: ScriptLimits) -> Self {
        Self { runner, limits }
    }

    /// Locate the runner binary: `MILLRACE_SANDBOX_RUNNER`, else the
    /// `millrace-sandbox-runner` binary next to the current executable.
    pub fn discover() -> SandboxResult<Self> {
        if let Ok(path) = std::env::var("MILLRACE_SANDBOX_RUNNER") {
            return Ok(Self::new(PathBuf::from(path), ScriptLimits::default()));
        }
        let current = std::env::current_exe()
            .map_err(|e| SandboxError::Internal(format!("current_exe: {}", e)))?;
        let sibling = current
            .parent()
            .map(|dir| dir.join("millrace-sandbox-runner"))
            .filter(|p| p.exists())
            .ok_or_else(|| {
                SandboxError::Internal("millrace-sandbox-runner binary not found".to_string())
            })?;
        Ok(Self::new(sibling, ScriptLimits::default()))
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.kill().await;
            }
        }
    }
}

#[async_trait]
impl SandboxExecutor for ProcessExecutor {
    async fn execute(&self, invocation: SandboxInvocation) -> ExecutorResult {
        let policy = &invocation.policy;
        let enforced = policy.limits.is_enforced();

        let cgroup = match (&policy.limits.cgroup_root, enforced) {
            (Some(root), true) => match CgroupScope::create(root, &policy.limits) {
                Ok(scope) => Some(scope),
                Err(e) => {
                    warn!(error = %e, "cgroup setup failed, falling back to rlimits");
                    None
                }
            },
            _ => None,
        };

        let request = ChildRequest {
            code: invocation.code.clone(),
            entry_point: invocation.entry_point.clone(),
            params: invocation.params.clone(),
            context: invocation.context.clone(),
            call_budget_ms: invocation.timeout.as_millis() as u64,
            compile_budget_ms: crate::script::compile_budget_for(invocation.timeout).as_millis()
                as u64,
            max_cpu_ms: policy.limits.cpu_ms,
            memory_bytes: policy.limits.memory_bytes,
            apply_rlimits: enforced && cgroup.is_none(),
            heartbeat_interval_ms: policy.heartbeat_interval.as_millis() as u64,
            network: policy.effective_network(),
            secrets: invocation.secrets.clone(),
            limits: self.limits.clone(),
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| SandboxError::Internal(format!("request encode: {}", e)))?;

        // The child imports no host state: empty environment, no inherited
        // stderr beyond our own logging.
        let mut child = Command::new(&self.runner)
            .env_clear()
            .env("MILLRACE_SANDBOX_CHILD", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Internal(format!("spawn runner: {}", e)))?;
        let pid = child.id().unwrap_or(0);

        if let Some(scope) = &cgroup
            && let Err(e) = scope.attach(pid)
        {
            warn!(error = %e, "failed to attach child to cgroup");
        }

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Internal("child stdin unavailable".to_string()))?;
        stdin
            .write_all(request_json.as_bytes())
            .await
            .map_err(|e| SandboxError::Internal(format!("write request: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| SandboxError::Internal(format!("write request: {}", e)))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Internal("child stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let started = Instant::now();
        let heartbeat_timeout = policy.effective_heartbeat_timeout();
        // Wall-clock ceiling: the child enforces the budget itself; the
        // parent allows compile + call plus slack before stepping in.
        let hard_deadline = invocation.timeout + Duration::from_secs(2);
        let mut last_beat = Instant::now();
        // Accesses streamed by the child so far; the audit trail when the
        // run ends without a terminal frame.
        let mut seen_accesses: Vec<NetworkAccess> = Vec::new();
        let mut poll = tokio::time::interval(USAGE_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let terminal = loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let frame: ChildFrame = match serde_json::from_str(&line) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    debug!(error = %e, "ignoring malformed child frame");
                                    continue;
                                }
                            };
                            match frame {
                                ChildFrame::Heartbeat { .. } => {
                                    last_beat = Instant::now();
                                }
                                ChildFrame::Access { access } => {
                                    seen_accesses.push(access);
                                }
                                terminal => break Some(terminal),
                            }
                        }
                        // Stream closed without a terminal frame: the child
                        // died (rlimit kill, crash). Classified below.
                        Ok(None) => break None,
                        Err(e) => {
                            return Err(SandboxFailure {
                                error: SandboxError::Internal(format!("child read: {}", e)),
                                accesses: seen_accesses,
                            });
                        }
                    }
                }
                _ = poll.tick() => {
                    if invocation.abort.load(Ordering::Relaxed) {
                        self.terminate(&mut child).await;
                        return Err(SandboxFailure {
                            error: SandboxError::Abort,
                            accesses: seen_accesses,
                        });
                    }
                    let stale = last_beat.elapsed();
                    if stale > heartbeat_timeout {
                        warn!(pid, stale_ms = stale.as_millis() as u64, "child heartbeat timed out");
                        self.terminate(&mut child).await;
                        return Err(SandboxFailure {
                            error: SandboxError::HeartbeatTimeout {
                                stale_ms: stale.as_millis() as u64,
                            },
                            accesses: seen_accesses,
                        });
                    }
                    if started.elapsed() > hard_deadline {
                        self.terminate(&mut child).await;
                        return Err(SandboxFailure {
                            error: SandboxError::Timeout {
                                elapsed_ms: started.elapsed().as_millis() as u64,
                                budget_ms: invocation.timeout.as_millis() as u64,
                            },
                            accesses: seen_accesses,
                        });
                    }
                    if enforced && let Some(usage) = sample_proc_usage(pid) {
                        if let Some(limit) = policy.limits.cpu_ms
                            && usage.cpu_ms > limit
                        {
                            self.terminate(&mut child).await;
                            return Err(SandboxFailure {
                                error: SandboxError::ResourceLimit {
                                    resource: LimitedResource::Cpu,
                                    usage: usage.cpu_ms,
                                    limit,
                                },
                                accesses: seen_accesses,
                            });
                        }
                        if let Some(limit) = policy.limits.memory_bytes
                            && usage.rss_bytes > limit
                        {
                            self.terminate(&mut child).await;
                            return Err(SandboxFailure {
                                error: SandboxError::ResourceLimit {
                                    resource: LimitedResource::Memory,
                                    usage: usage.rss_bytes,
                                    limit,
                                },
                                accesses: seen_accesses,
                            });
                        }
                    }
                }
            }
        };

        let status = child.wait().await.ok();
        drop(cgroup);

        // Parent-side redaction backstop; the child already redacted.
        let redactor = Redactor::from_context(
            &[&invocation.params, &invocation.context],
            &invocation.secrets,
        );

        match terminal {
            Some(ChildFrame::Done {
                result,
                mut logs,
                accesses,
                duration_ms,
            }) => {
                redactor.redact_logs(&mut logs);
                Ok(SandboxOutcome {
                    result: redactor.redact_value(&result),
                    logs,
                    accesses,
                    duration_ms,
                })
            }
            // The child's own list is authoritative: it includes decisions
            // made after the last streamed frame.
            Some(ChildFrame::Failed { error, accesses, .. }) => {
                Err(SandboxFailure { error, accesses })
            }
            Some(ChildFrame::Heartbeat { .. }) | Some(ChildFrame::Access { .. }) => {
                unreachable!("non-terminal frames never break the loop")
            }
            None => Err(SandboxFailure {
                error: classify_silent_exit(status, &invocation),
                accesses: seen_accesses,
            }),
        }
    }

    fn script_limits(&self) -> ScriptLimits {
        self.limits.clone()
    }
}

/// The child exited without a terminal frame; infer why from its status.
fn classify_silent_exit(
    status: Option<std::process::ExitStatus>,
    invocation: &SandboxInvocation,
) -> SandboxError {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(status) = status {
            match status.signal() {
                Some(libc::SIGXCPU) => {
                    return SandboxError::ResourceLimit {
                        resource: LimitedResource::Cpu,
                        usage: invocation.policy.limits.cpu_ms.unwrap_or(0),
                        limit: invocation.policy.limits.cpu_ms.unwrap_or(0),
                    };
                }
                Some(libc::SIGKILL) if invocation.policy.limits.memory_bytes.is_some() => {
                    // cgroup OOM kills look like SIGKILL.
                    return SandboxError::ResourceLimit {
                        resource: LimitedResource::Memory,
                        usage: invocation.policy.limits.memory_bytes.unwrap_or(0),
                        limit: invocation.policy.limits.memory_bytes.unwrap_or(0),
                    };
                }
                _ => {}
            }
        }
    }
    let _ = &invocation;
    SandboxError::Internal(format!(
        "sandbox child exited without a result ({:?})",
        status
    ))
}
