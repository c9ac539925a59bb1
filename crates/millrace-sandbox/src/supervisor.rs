//! Sandbox supervisor
//!
//! The single entry point the engine calls to run tenant code. Resolves
//! the effective policy from the tenancy overlay, gates on the isolation
//! watchdog, dispatches to the configured executor, and forwards network
//! audit records to the connection service.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::Utc;
use millrace_kernel::{SandboxEnvConfig, SandboxExecutorKind};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{SandboxError, SandboxResult};
use crate::executor::process::ProcessExecutor;
use crate::executor::thread::ThreadExecutor;
use crate::executor::{SandboxExecutor, SandboxInvocation, SandboxOutcome};
use crate::net::{AuditContext, NetworkAuditRecord, NetworkAuditSink, NetworkDecision, NullAuditSink};
use crate::policy::{PolicyOverrides, TenancyConfig};
use crate::watchdog::{IsolationWatchdog, ScopeKey, WatchdogConfig, WatchdogVerdict};

/// One sandbox call as the engine sees it.
pub struct SandboxRequest {
    pub scope: ScopeKey,
    pub code: String,
    pub entry_point: String,
    pub params: Value,
    pub context: Value,
    /// Caller-supplied secrets beyond what redaction harvests itself.
    pub secrets: Vec<String>,
    pub timeout: Duration,
    pub tenancy: TenancyConfig,
    pub overrides: PolicyOverrides,
    pub audit_context: AuditContext,
    pub abort: Arc<AtomicBool>,
}

pub struct SandboxSupervisor {
    env: SandboxEnvConfig,
    executor: Arc<dyn SandboxExecutor>,
    audit: Arc<dyn NetworkAuditSink>,
    watchdog: IsolationWatchdog,
}

impl SandboxSupervisor {
    pub fn new(
        env: SandboxEnvConfig,
        executor: Arc<dyn SandboxExecutor>,
        audit: Arc<dyn NetworkAuditSink>,
    ) -> Self {
        Self {
            env,
            executor,
            audit,
            watchdog: IsolationWatchdog::new(WatchdogConfig::default()),
        }
    }

    pub fn with_watchdog_config(mut self, config: WatchdogConfig) -> Self {
        self.watchdog = IsolationWatchdog::new(config);
        self
    }

    /// Build with the executor the environment selects. Falls back to the
    /// thread executor when the runner binary cannot be located, so
    /// embedded and test deployments work out of the box.
    pub fn from_env(env: SandboxEnvConfig, audit: Arc<dyn NetworkAuditSink>) -> Self {
        let executor: Arc<dyn SandboxExecutor> = match env.executor {
            SandboxExecutorKind::Worker => Arc::new(ThreadExecutor::default()),
            SandboxExecutorKind::Process => match ProcessExecutor::discover() {
                Ok(executor) => Arc::new(executor),
                Err(e) => {
                    warn!(error = %e, "sandbox runner not found, using thread executor");
                    Arc::new(ThreadExecutor::default())
                }
            },
        };
        Self::new(env, executor, audit)
    }

    /// Convenience for tests and single-process embeddings.
    pub fn in_process(env: SandboxEnvConfig) -> Self {
        Self::new(env, Arc::new(ThreadExecutor::default()), Arc::new(NullAuditSink))
    }

    /// Run tenant code under the effective policy for this call.
    pub async fn execute(&self, request: SandboxRequest) -> SandboxResult<SandboxOutcome> {
        if self.watchdog.is_quarantined(&request.scope) {
            return Err(SandboxError::PolicyViolation(format!(
                "sandbox scope for organization {} is quarantined",
                request.scope.organization_id
            )));
        }

        let policy = request.tenancy.effective_policy(&self.env, &request.overrides);
        let invocation = SandboxInvocation {
            code: request.code,
            entry_point: request.entry_point,
            params: request.params,
            context: request.context,
            timeout: request.timeout,
            policy,
            secrets: request.secrets,
            abort: request.abort,
        };

        let outcome = self.executor.execute(invocation).await;

        // Every allow/deny decision reaches the connection service, however
        // the run ended: successes carry their list, failures carry theirs.
        let accesses = match &outcome {
            Ok(success) => success.accesses.as_slice(),
            Err(failure) => failure.accesses.as_slice(),
        };
        for access in accesses {
            self.audit
                .record(NetworkAuditRecord {
                    context: request.audit_context.clone(),
                    attempted_host: access.host.clone(),
                    decision: access.decision.clone(),
                    at: access.at,
                })
                .await;
        }

        match &outcome {
            Ok(_) => {
                self.watchdog.record_success(&request.scope);
            }
            Err(failure) => {
                let error = &failure.error;
                // A denial whose access record was lost (killed child, old
                // runner) is still synthesized for the sink.
                if let SandboxError::NetworkDenied { host, reason } = error
                    && !failure
                        .accesses
                        .iter()
                        .any(|a| a.host == *host && a.denial_reason().is_some())
                {
                    self.audit
                        .record(NetworkAuditRecord {
                            context: request.audit_context.clone(),
                            attempted_host: host.clone(),
                            decision: NetworkDecision::Denied {
                                reason: reason.clone(),
                            },
                            at: Utc::now(),
                        })
                        .await;
                }
                if error.is_isolation_violation() {
                    let heartbeat_miss = matches!(error, SandboxError::HeartbeatTimeout { .. });
                    match self.watchdog.record_violation(&request.scope, heartbeat_miss) {
                        WatchdogVerdict::Healthy => {}
                        WatchdogVerdict::Recycle => {
                            info!(
                                organization_id = %request.scope.organization_id,
                                "recycling sandbox executor after repeated violations"
                            );
                            self.executor.recycle();
                        }
                        WatchdogVerdict::Quarantine => {
                            warn!(
                                organization_id = %request.scope.organization_id,
                                "quarantining sandbox scope"
                            );
                        }
                    }
                }
            }
        }

        outcome.map_err(|failure| failure.error)
    }

    /// Scope health snapshot for observability.
    pub fn scope_health(&self, scope: &ScopeKey) -> (u32, u32, bool) {
        self.watchdog.health(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetworkRules;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    fn request(code: &str) -> SandboxRequest {
        SandboxRequest {
            scope: ScopeKey::for_organization("node-sandbox", "org-1"),
            code: code.to_string(),
            entry_point: "main".to_string(),
            params: json!({}),
            context: json!({}),
            secrets: Vec::new(),
            timeout: Duration::from_secs(5),
            tenancy: TenancyConfig::default(),
            overrides: PolicyOverrides::default(),
            audit_context: AuditContext {
                organization_id: "org-1".into(),
                ..Default::default()
            },
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        records: Mutex<Vec<NetworkAuditRecord>>,
    }

    #[async_trait]
    impl NetworkAuditSink for CapturingSink {
        async fn record(&self, record: NetworkAuditRecord) {
            self.records.lock().push(record);
        }
    }

    #[tokio::test]
    async fn executes_and_returns_outcome() {
        let supervisor = SandboxSupervisor::in_process(SandboxEnvConfig::default());
        let out = supervisor
            .execute(request("fn main(params, context) { 40 + 2 }"))
            .await
            .unwrap();
        assert_eq!(out.result, json!(42));
    }

    #[tokio::test]
    async fn network_denial_is_audited() {
        let sink = Arc::new(CapturingSink::default());
        let supervisor = SandboxSupervisor::new(
            SandboxEnvConfig::default(),
            Arc::new(ThreadExecutor::default()),
            sink.clone(),
        );
        let mut req = request(r#"fn main(params, context) { fetch("https://evil.test/") }"#);
        req.tenancy.network =
            NetworkRules::from_raw(&["api.example.com".to_string()], &[]).unwrap();

        let err = supervisor.execute(req).await.unwrap_err();
        assert!(matches!(err, SandboxError::NetworkDenied { .. }));

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempted_host, "evil.test");
        assert_eq!(records[0].context.organization_id, "org-1");
        assert!(matches!(
            records[0].decision,
            NetworkDecision::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn allowed_accesses_are_audited_when_the_run_fails_later() {
        let sink = Arc::new(CapturingSink::default());
        let supervisor = SandboxSupervisor::new(
            SandboxEnvConfig::default(),
            Arc::new(ThreadExecutor::default()),
            sink.clone(),
        );
        // Port 9 refuses immediately: the policy decision is Allowed, then
        // the request itself fails and the script errors out.
        let mut req = request(r#"fn main(params, context) { fetch("http://127.0.0.1:9/") }"#);
        req.tenancy.network = NetworkRules::from_raw(&["127.0.0.1".to_string()], &[]).unwrap();

        let err = supervisor.execute(req).await.unwrap_err();
        assert!(matches!(err, SandboxError::Script(_)), "got {:?}", err);

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempted_host, "127.0.0.1");
        assert!(matches!(records[0].decision, NetworkDecision::Allowed));
    }

    #[tokio::test]
    async fn repeated_violations_quarantine_then_success_lifts() {
        let supervisor = SandboxSupervisor::in_process(SandboxEnvConfig::default())
            .with_watchdog_config(WatchdogConfig {
                recycle_threshold: 1,
                quarantine_threshold: 2,
                quarantine_cooldown: Duration::from_millis(10),
            });
        let denied_code = r#"fn main(params, context) { fetch("https://evil.test/") }"#;
        let make = |code: &str| {
            let mut req = request(code);
            req.tenancy.network =
                NetworkRules::from_raw(&["api.example.com".to_string()], &[]).unwrap();
            req
        };

        assert!(supervisor.execute(make(denied_code)).await.is_err());
        assert!(supervisor.execute(make(denied_code)).await.is_err());

        // Scope is quarantined now: even clean code fails fast.
        let err = supervisor
            .execute(request("fn main(params, context) { 1 }"))
            .await
            .unwrap_err();
        match &err {
            SandboxError::PolicyViolation(msg) => assert!(msg.contains("quarantined")),
            other => panic!("expected quarantine, got {:?}", other),
        }

        // A successful run from a different scope is unaffected.
        let mut other_scope = request("fn main(params, context) { 2 }");
        other_scope.scope = ScopeKey::for_organization("node-sandbox", "org-2");
        assert!(supervisor.execute(other_scope).await.is_ok());
    }
}
