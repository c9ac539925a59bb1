//! Worker-thread executor
//!
//! Runs the script runtime on `spawn_blocking` and supervises it from the
//! async side: heartbeat staleness, abort propagation, CPU budget (via the
//! script progress hook). Used where fork cost dominates; it cannot
//! hard-kill a script stuck inside a blocking host call, which is what the
//! process executor is for.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use super::{ExecutorResult, SandboxExecutor, SandboxFailure, SandboxInvocation, SandboxOutcome};
use crate::error::SandboxError;
use crate::net::NetworkAccess;
use crate::redact::Redactor;
use crate::script::{ScriptJob, ScriptLimits, compile_budget_for, run_script};

/// Supervision poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ThreadExecutor {
    limits: ScriptLimits,
}

impl ThreadExecutor {
    pub fn new(limits: ScriptLimits) -> Self {
        Self { limits }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new(ScriptLimits::default())
    }
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl SandboxExecutor for ThreadExecutor {
    async fn execute(&self, invocation: SandboxInvocation) -> ExecutorResult {
        let heartbeat = Arc::new(AtomicI64::new(now_epoch_ms()));
        let script_abort = Arc::new(AtomicBool::new(false));
        let in_host_call = Arc::new(AtomicBool::new(false));
        let accesses: Arc<Mutex<Vec<NetworkAccess>>> = Arc::new(Mutex::new(Vec::new()));
        let redactor = Redactor::from_context(
            &[&invocation.params, &invocation.context],
            &invocation.secrets,
        );

        let job = ScriptJob {
            code: invocation.code.clone(),
            entry_point: invocation.entry_point.clone(),
            params: invocation.params.clone(),
            context: invocation.context.clone(),
            compile_budget: compile_budget_for(invocation.timeout),
            call_budget: invocation.timeout,
            max_cpu_ms: invocation.policy.limits.cpu_ms,
            network: invocation.policy.effective_network(),
            limits: self.limits.clone(),
            heartbeat: Arc::clone(&heartbeat),
            abort: Arc::clone(&script_abort),
            in_host_call: Arc::clone(&in_host_call),
            accesses: Arc::clone(&accesses),
        };

        let mut handle = tokio::task::spawn_blocking(move || run_script(&job));

        let heartbeat_timeout = invocation.policy.effective_heartbeat_timeout();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let raw = loop {
            tokio::select! {
                joined = &mut handle => {
                    break joined.map_err(|e| SandboxFailure {
                        error: SandboxError::Internal(format!("script task panicked: {}", e)),
                        accesses: accesses.lock().clone(),
                    })?;
                }
                _ = ticker.tick() => {
                    if invocation.abort.load(Ordering::Relaxed) {
                        script_abort.store(true, Ordering::Relaxed);
                    }
                    let stale_ms =
                        now_epoch_ms().saturating_sub(heartbeat.load(Ordering::Relaxed)) as u64;
                    // A script parked in a host call is bounded by that
                    // call's own timeout, not the heartbeat.
                    if stale_ms > heartbeat_timeout.as_millis() as u64
                        && !in_host_call.load(Ordering::Relaxed)
                    {
                        warn!(stale_ms, "sandbox script stopped making progress");
                        // Flag the script so it dies the moment it resumes;
                        // the thread itself cannot be killed from here.
                        script_abort.store(true, Ordering::Relaxed);
                        return Err(SandboxFailure {
                            error: SandboxError::HeartbeatTimeout { stale_ms },
                            accesses: accesses.lock().clone(),
                        });
                    }
                }
            }
        };

        let output = raw.map_err(|error| SandboxFailure {
            error,
            accesses: accesses.lock().clone(),
        })?;
        let mut logs = output.logs;
        redactor.redact_logs(&mut logs);
        Ok(SandboxOutcome {
            result: redactor.redact_value(&output.result),
            logs,
            accesses: output.accesses,
            duration_ms: output.duration_ms,
        })
    }

    fn script_limits(&self) -> ScriptLimits {
        self.limits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetworkRules;
    use crate::policy::SandboxPolicy;
    use serde_json::json;

    fn invocation(code: &str) -> SandboxInvocation {
        SandboxInvocation {
            code: code.to_string(),
            entry_point: "main".to_string(),
            params: json!({"value": 7}),
            context: json!({}),
            timeout: Duration::from_secs(5),
            policy: SandboxPolicy::default(),
            secrets: Vec::new(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn runs_entry_point() {
        let executor = ThreadExecutor::default();
        let out = executor
            .execute(invocation("fn main(params, context) { params.value + 1 }"))
            .await
            .unwrap();
        assert_eq!(out.result, json!(8));
    }

    #[tokio::test]
    async fn redacts_secrets_from_logs_and_result() {
        let executor = ThreadExecutor::default();
        let mut inv = invocation(
            r#"
                fn main(params, context) {
                    log("key is " + params.credentials.api_key);
                    "echo: " + params.credentials.api_key
                }
            "#,
        );
        inv.params = json!({"credentials": {"api_key": "sk-supersecret"}});
        let out = executor.execute(inv).await.unwrap();
        assert_eq!(out.logs, vec!["[LOG] key is [REDACTED]"]);
        assert_eq!(out.result, json!("echo: [REDACTED]"));
    }

    #[tokio::test]
    async fn abort_signal_propagates() {
        let executor = ThreadExecutor::default();
        let mut inv = invocation("fn main(params, context) { while true {} }");
        inv.timeout = Duration::from_secs(30);
        let abort = Arc::clone(&inv.abort);

        let run = tokio::spawn(async move { executor.execute(inv).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        abort.store(true, Ordering::Relaxed);

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err.error, SandboxError::Abort));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cpu_limit_enforced_via_policy() {
        let executor = ThreadExecutor::default();
        let mut inv = invocation("fn main(params, context) { while true {} }");
        inv.timeout = Duration::from_secs(30);
        inv.policy.limits.cpu_ms = Some(150);
        let err = executor.execute(inv).await.unwrap_err();
        assert!(matches!(err.error, SandboxError::ResourceLimit { .. }));
    }

    #[tokio::test]
    async fn network_denial_surfaces_with_audit_trail() {
        let executor = ThreadExecutor::default();
        let mut inv = invocation(r#"fn main(params, context) { fetch("https://evil.test/") }"#);
        inv.policy.network =
            NetworkRules::from_raw(&["api.example.com".to_string()], &[]).unwrap();
        let err = executor.execute(inv).await.unwrap_err();
        match &err.error {
            SandboxError::NetworkDenied { host, reason } => {
                assert_eq!(host, "evil.test");
                assert_eq!(reason, "host_not_allowlisted");
            }
            other => panic!("expected NetworkDenied, got {:?}", other),
        }
        // The failure carries the decision for the audit sink.
        assert_eq!(err.accesses.len(), 1);
        assert_eq!(err.accesses[0].host, "evil.test");
    }
}
