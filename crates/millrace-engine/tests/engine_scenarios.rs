//! End-to-end orchestrator scenarios: suspension and timer resume,
//! deterministic rescue after a lost worker, sandbox policy enforcement
//! through the full engine path, and tenant concurrency ceilings.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use millrace_engine::{
    EnqueueRequest, ExecutionOrchestrator, InMemoryWorkflowRepository, NodeContext, NodeHandler,
    NodeOutput, ResumeRequest, StaticTenancyConfig, StaticTenantDirectory, TenantProfile,
};
use millrace_kernel::{
    EngineConfig, EngineError, EngineResult, ErrorCode, Execution, ExecutionStatus, NodeKind,
    SandboxEnvConfig, TenantLimits, TriggerType, WorkflowGraph, WorkflowNode, hash,
};
use millrace_sandbox::{
    NetworkAuditRecord, NetworkAuditSink, NetworkRules, ResourceLimits, SandboxSupervisor,
    TenancyConfig, ThreadExecutor,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;

/// Handler that counts calls per node and runs configured behaviors.
#[derive(Default)]
struct ScriptedHandler {
    calls: Mutex<HashMap<String, u32>>,
    delays: Mutex<HashMap<String, Duration>>,
    concurrent: AtomicI32,
    peak_concurrent: AtomicI32,
}

impl ScriptedHandler {
    fn call_count(&self, node_id: &str) -> u32 {
        self.calls.lock().get(node_id).copied().unwrap_or(0)
    }

    fn with_delay(self, node_id: &str, delay: Duration) -> Self {
        self.delays.lock().insert(node_id.to_string(), delay);
        self
    }
}

#[async_trait]
impl NodeHandler for ScriptedHandler {
    async fn execute(
        &self,
        _kind: &NodeKind,
        node: &WorkflowNode,
        input: &Value,
        _ctx: &NodeContext,
    ) -> EngineResult<NodeOutput> {
        *self.calls.lock().entry(node.id.clone()).or_insert(0) += 1;

        let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(current, Ordering::SeqCst);
        let delay = self.delays.lock().get(&node.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        Ok(NodeOutput::value(json!({
            "node": node.id,
            "echo": input,
        })))
    }
}

fn test_config() -> EngineConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    EngineConfig {
        worker_concurrency: 4,
        tenant_concurrency: 2,
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn wait_for_status(
    orchestrator: &Arc<ExecutionOrchestrator>,
    execution_id: Uuid,
    status: ExecutionStatus,
    timeout: Duration,
) -> Execution {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(execution)) = orchestrator.run_manager().get(execution_id).await {
            if execution.status == status {
                return execution;
            }
            if execution.status.is_terminal() && execution.status != status {
                panic!(
                    "execution {} reached {} while waiting for {}: {:?}",
                    execution_id, execution.status, status, execution.error
                );
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {} on {}", status, execution_id);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Delay node suspends on a durable timer; the sweeper resumes it and the
/// run finishes with its deterministic keys intact.
#[tokio::test(flavor = "multi_thread")]
async fn delay_suspends_then_timer_resumes() {
    let handler = Arc::new(ScriptedHandler::default());
    let workflows = Arc::new(InMemoryWorkflowRepository::new());

    let mut graph = WorkflowGraph::new("wf-delay", "Delayed");
    graph.add_node(WorkflowNode::new("a", "A", NodeKind::Transform));
    graph.add_node(
        WorkflowNode::new("pause", "Pause", NodeKind::Delay).with_params(json!({"delayMs": 1000})),
    );
    graph.add_node(WorkflowNode::new("b", "B", NodeKind::Transform));
    graph.connect("a", "pause");
    graph.connect("pause", "b");
    workflows.register(graph);

    let orchestrator = ExecutionOrchestrator::builder(test_config())
        .handlers(handler.clone())
        .workflows(workflows)
        .build()
        .unwrap();
    orchestrator.start();

    let execution_id = orchestrator
        .enqueue(EnqueueRequest {
            workflow_id: "wf-delay".into(),
            organization_id: "org-1".into(),
            user_id: None,
            trigger_type: TriggerType::Manual,
            trigger_data: json!({}),
            replay_of: None,
        })
        .await
        .unwrap();

    // The execution suspends while the timer is pending.
    let waiting = wait_for_status(
        &orchestrator,
        execution_id,
        ExecutionStatus::Waiting,
        Duration::from_secs(5),
    )
    .await;
    let resume_state = waiting.metadata.resume_state.expect("resume state persisted");
    assert_eq!(resume_state.remaining_node_ids, vec!["b"]);
    assert!(resume_state.node_outputs.contains_key("a"));
    let key_a_at_suspend = resume_state.idempotency_keys["a"].clone();

    // The sweeper re-enqueues; a worker finishes the run.
    let done = wait_for_status(
        &orchestrator,
        execution_id,
        ExecutionStatus::Completed,
        Duration::from_secs(10),
    )
    .await;

    assert_eq!(handler.call_count("a"), 1, "node a must not re-run on resume");
    assert_eq!(handler.call_count("b"), 1);
    assert_eq!(
        done.metadata.deterministic_keys.idempotency["a"], key_a_at_suspend,
        "idempotency key must survive suspension byte-for-byte"
    );
    assert!(done.metadata.deterministic_keys.idempotency.contains_key("b"));

    orchestrator.stop().await;
}

/// A worker dies mid-execution; the resume path replays from the snapshot
/// without re-running completed nodes, and reconstructed keys match what
/// the dead worker would have computed.
#[tokio::test(flavor = "multi_thread")]
async fn crashed_worker_resume_is_deterministic() {
    let handler = Arc::new(ScriptedHandler::default());
    let workflows = Arc::new(InMemoryWorkflowRepository::new());

    let mut graph = WorkflowGraph::new("wf-rescue", "Rescued");
    graph.add_node(WorkflowNode::new("n1", "First", NodeKind::Transform));
    graph.add_node(WorkflowNode::new("n2", "Second", NodeKind::Transform));
    graph.connect("n1", "n2");
    workflows.register(graph);

    let orchestrator = ExecutionOrchestrator::builder(test_config())
        .handlers(handler.clone())
        .workflows(workflows)
        .build()
        .unwrap();
    orchestrator.start();

    // Worker A's half-finished state, as persisted before it died: n1 done,
    // n2 next. Its idempotency key for n1 rode along in the snapshot.
    let execution = Execution::new("wf-rescue", "org-1", None, TriggerType::Manual, json!({}));
    let execution_id = execution.id;
    orchestrator
        .run_manager()
        .create_execution(execution)
        .await
        .unwrap();

    let seed = json!(execution_id.to_string());
    let key_n1 = hash::idempotency_key("wf-rescue", "n1", Some(&seed));
    let mut resume_state = millrace_kernel::ResumeState::new(chrono::Utc::now());
    resume_state
        .node_outputs
        .insert("n1".into(), json!({"node": "n1"}));
    resume_state.remaining_node_ids = vec!["n2".into()];
    resume_state.next_node_id = Some("n2".into());
    resume_state
        .idempotency_keys
        .insert("n1".into(), key_n1.clone());

    orchestrator
        .enqueue_resume(ResumeRequest {
            execution_id,
            resume_state,
            initial_data: None,
            timer_id: None,
            token_id: None,
        })
        .await
        .unwrap();

    let done = wait_for_status(
        &orchestrator,
        execution_id,
        ExecutionStatus::Completed,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(handler.call_count("n1"), 0, "completed node must not re-run");
    assert_eq!(handler.call_count("n2"), 1);
    // Worker B's key for n2 is exactly what worker A would have generated.
    assert_eq!(
        done.metadata.deterministic_keys.idempotency["n2"],
        hash::idempotency_key("wf-rescue", "n2", Some(&seed))
    );
    assert_eq!(done.metadata.deterministic_keys.idempotency["n1"], key_n1);

    orchestrator.stop().await;
}

/// Tenant code that spins forever trips the CPU guard; the node is not
/// retried and the execution fails with the resource-limit code.
#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn sandbox_cpu_limit_fails_execution_without_retry() {
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    let mut graph = WorkflowGraph::new("wf-spin", "Spinner");
    graph.add_node(
        WorkflowNode::new("spin", "Spin", NodeKind::Sandboxed)
            .with_runtime("fn main(params, context) { while true {} }", "main")
            .with_timeout_ms(30_000),
    );
    workflows.register(graph);

    let tenancy = TenancyConfig {
        limits: ResourceLimits {
            cpu_ms: Some(150),
            ..Default::default()
        },
        ..Default::default()
    };
    let sandbox = Arc::new(SandboxSupervisor::new(
        SandboxEnvConfig::default(),
        Arc::new(ThreadExecutor::default()),
        Arc::new(millrace_sandbox::NullAuditSink),
    ));

    let orchestrator = ExecutionOrchestrator::builder(test_config())
        .workflows(workflows)
        .sandbox(sandbox)
        .tenancy(Arc::new(StaticTenancyConfig::new(tenancy)))
        .build()
        .unwrap();
    orchestrator.start();

    let execution_id = orchestrator
        .enqueue(EnqueueRequest {
            workflow_id: "wf-spin".into(),
            organization_id: "org-1".into(),
            user_id: None,
            trigger_type: TriggerType::Manual,
            trigger_data: json!({}),
            replay_of: None,
        })
        .await
        .unwrap();

    let failed = wait_for_status(
        &orchestrator,
        execution_id,
        ExecutionStatus::Failed,
        Duration::from_secs(15),
    )
    .await;

    let error = failed.error.expect("failure details recorded");
    assert_eq!(error.code, ErrorCode::SandboxResourceLimit);
    // Exactly one attempt: policy violations are never retried.
    assert_eq!(
        orchestrator.retry_manager().attempt_count(execution_id, "spin"),
        1
    );
    let actionable = orchestrator.retry_manager().actionable_errors(
        &millrace_engine::ErrorFilter {
            code: Some(ErrorCode::SandboxResourceLimit),
            ..Default::default()
        },
    );
    assert!(!actionable.is_empty());

    orchestrator.stop().await;
}

#[derive(Default)]
struct CapturingAudit {
    records: Mutex<Vec<NetworkAuditRecord>>,
}

#[async_trait]
impl NetworkAuditSink for CapturingAudit {
    async fn record(&self, record: NetworkAuditRecord) {
        self.records.lock().push(record);
    }
}

/// Sandbox fetch outside the allowlist is denied, audited with tenant
/// identity, and terminal for the execution.
#[tokio::test(flavor = "multi_thread")]
async fn sandbox_network_denial_is_audited_and_terminal() {
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    let mut graph = WorkflowGraph::new("wf-net", "Fetcher");
    graph.add_node(
        WorkflowNode::new("call", "Call", NodeKind::Sandboxed)
            .with_runtime(r#"fn main(params, context) { fetch("https://evil.test/") }"#, "main"),
    );
    workflows.register(graph);

    let audit = Arc::new(CapturingAudit::default());
    let tenancy = TenancyConfig {
        network: NetworkRules::from_raw(&["api.example.com".to_string()], &[]).unwrap(),
        ..Default::default()
    };
    let sandbox = Arc::new(SandboxSupervisor::new(
        SandboxEnvConfig::default(),
        Arc::new(ThreadExecutor::default()),
        audit.clone(),
    ));

    let orchestrator = ExecutionOrchestrator::builder(test_config())
        .workflows(workflows)
        .sandbox(sandbox)
        .tenancy(Arc::new(StaticTenancyConfig::new(tenancy)))
        .build()
        .unwrap();
    orchestrator.start();

    let execution_id = orchestrator
        .enqueue(EnqueueRequest {
            workflow_id: "wf-net".into(),
            organization_id: "org-1".into(),
            user_id: None,
            trigger_type: TriggerType::Manual,
            trigger_data: json!({}),
            replay_of: None,
        })
        .await
        .unwrap();

    let failed = wait_for_status(
        &orchestrator,
        execution_id,
        ExecutionStatus::Failed,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(failed.error.unwrap().code, ErrorCode::SandboxNetworkPolicy);

    let records = audit.records.lock();
    let denial = records
        .iter()
        .find(|r| r.attempted_host == "evil.test")
        .expect("denial audited");
    assert_eq!(denial.context.organization_id, "org-1");
    assert_eq!(denial.context.execution_id, Some(execution_id));
    assert_eq!(denial.context.node_id.as_deref(), Some("call"));

    orchestrator.stop().await;
}

/// The per-tenant running ceiling holds even with a burst of queued work
/// and more worker slots than the tenant may use.
#[tokio::test(flavor = "multi_thread")]
async fn tenant_concurrency_ceiling_holds_under_burst() {
    let handler =
        Arc::new(ScriptedHandler::default().with_delay("work", Duration::from_millis(150)));
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    let mut graph = WorkflowGraph::new("wf-burst", "Burst");
    graph.add_node(WorkflowNode::new("work", "Work", NodeKind::Transform));
    workflows.register(graph);

    let tenants = Arc::new(StaticTenantDirectory::new(TenantProfile {
        limits: TenantLimits {
            max_concurrent_executions: 2,
            max_executions_per_minute: 100,
        },
        ..Default::default()
    }));

    let orchestrator = ExecutionOrchestrator::builder(test_config())
        .handlers(handler.clone())
        .workflows(workflows)
        .tenants(tenants)
        .build()
        .unwrap();
    orchestrator.start();

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(
            orchestrator
                .enqueue(EnqueueRequest {
                    workflow_id: "wf-burst".into(),
                    organization_id: "org-1".into(),
                    user_id: None,
                    trigger_type: TriggerType::Manual,
                    trigger_data: json!({}),
                    replay_of: None,
                })
                .await
                .unwrap(),
        );
    }

    for id in &ids {
        wait_for_status(
            &orchestrator,
            *id,
            ExecutionStatus::Completed,
            Duration::from_secs(20),
        )
        .await;
    }

    assert!(
        handler.peak_concurrent.load(Ordering::SeqCst) <= 2,
        "tenant ran {} nodes concurrently with a ceiling of 2",
        handler.peak_concurrent.load(Ordering::SeqCst)
    );

    orchestrator.stop().await;
}

/// Retry then cache: a transient failure is absorbed, the result lands in
/// the idempotency cache, and a queue-level redelivery of the same node
/// never re-invokes the operation.
#[tokio::test(flavor = "multi_thread")]
async fn transient_failure_retries_then_serves_from_cache() {
    struct FlakyOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl NodeHandler for FlakyOnce {
        async fn execute(
            &self,
            _kind: &NodeKind,
            _node: &WorkflowNode,
            _input: &Value,
            _ctx: &NodeContext,
        ) -> EngineResult<NodeOutput> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::Other("timeout after 1s".into()))
            } else {
                Ok(NodeOutput::value(json!({"ok": true, "v": 42})))
            }
        }
    }

    let handler = Arc::new(FlakyOnce {
        calls: AtomicU32::new(0),
    });
    let workflows = Arc::new(InMemoryWorkflowRepository::new());
    let mut graph = WorkflowGraph::new("wf-flaky", "Flaky");
    graph.add_node(WorkflowNode::new("n1", "Flaky", NodeKind::Http));
    workflows.register(graph);

    let orchestrator = ExecutionOrchestrator::builder(test_config())
        .handlers(handler.clone())
        .workflows(workflows)
        .build()
        .unwrap();
    orchestrator.start();

    let execution_id = orchestrator
        .enqueue(EnqueueRequest {
            workflow_id: "wf-flaky".into(),
            organization_id: "org-1".into(),
            user_id: None,
            trigger_type: TriggerType::Manual,
            trigger_data: json!({"dedupeToken": "dt-1"}),
            replay_of: None,
        })
        .await
        .unwrap();

    let done = wait_for_status(
        &orchestrator,
        execution_id,
        ExecutionStatus::Completed,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(done.node_outputs["n1"], json!({"ok": true, "v": 42}));

    // Same (execution, node, key) through the retry manager again: served
    // from the cache without touching the operation.
    let key = done.metadata.deterministic_keys.idempotency["n1"].clone();
    let cached = orchestrator
        .retry_manager()
        .execute_with_retry(
            "n1",
            execution_id,
            |_| async { panic!("op must not run on a cache hit") },
            millrace_engine::RetryOptions {
                idempotency_key: Some(key),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cached, json!({"ok": true, "v": 42}));
    assert!(orchestrator.retry_manager().stats().cached_keys >= 1);

    orchestrator.stop().await;
}
