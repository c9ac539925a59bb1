//! Run-state store
//!
//! Records every execution and node attempt for observability and replay.
//! [`RunExecutionManager`] is the write path the orchestrator uses; every
//! mutation appends a sanitized timeline event and keeps the execution
//! rollups current.

pub mod entities;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use millrace_kernel::{
    AttemptMetadata, AttemptStatus, ErrorDetails, Execution, ExecutionStatus, Lease, NodeAttempt,
    ResumeState, ResumeToken, TimelineEvent, TimelineEventKind, WorkflowNode, WorkflowTimer,
};
use millrace_sandbox::Redactor;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

pub use entities::{
    ExecutionQuery, ExecutionSort, ExecutionStats, RunStoreError, RunStoreResult, StatsBucket,
    StatsEntry,
};
pub use memory::MemoryExecutionStore;

/// Cap on any single timeline attribute value.
const TIMELINE_VALUE_CAP: usize = 8 * 1024;

/// Default retention for terminal executions.
const DEFAULT_RETENTION: chrono::Duration = chrono::Duration::days(30);

/// Storage seam for executions, attempts, timers and resume tokens.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert_execution(&self, execution: Execution) -> RunStoreResult<()>;
    async fn update_execution(&self, execution: Execution) -> RunStoreResult<()>;
    async fn get_execution(&self, id: Uuid) -> RunStoreResult<Option<Execution>>;
    async fn find_by_correlation(&self, correlation_id: &str) -> RunStoreResult<Option<Execution>>;
    async fn list_executions(&self, query: &ExecutionQuery) -> RunStoreResult<Vec<Execution>>;

    /// Insert or replace one attempt row. Must reject a second `running`
    /// attempt for the same `(execution, node)`.
    async fn put_attempt(&self, attempt: NodeAttempt) -> RunStoreResult<()>;
    async fn get_attempts(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> RunStoreResult<Vec<NodeAttempt>>;
    async fn attempts_for_execution(&self, execution_id: Uuid) -> RunStoreResult<Vec<NodeAttempt>>;

    async fn insert_timer(&self, timer: WorkflowTimer) -> RunStoreResult<()>;
    /// Atomically claim due timers: `pending → in_flight`.
    async fn claim_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> RunStoreResult<Vec<WorkflowTimer>>;
    async fn complete_timer(&self, id: Uuid) -> RunStoreResult<()>;
    async fn fail_timer(&self, id: Uuid, error: &str, retry_at: DateTime<Utc>)
    -> RunStoreResult<()>;
    async fn get_timer(&self, id: Uuid) -> RunStoreResult<Option<WorkflowTimer>>;

    async fn insert_token(&self, token: ResumeToken) -> RunStoreResult<()>;
    /// Single-use consume; fails on reuse or expiry.
    async fn consume_token(&self, id: Uuid, now: DateTime<Utc>) -> RunStoreResult<ResumeToken>;

    /// Retention sweep; removes terminal executions and their children.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> RunStoreResult<usize>;
}

/// Options for starting one node attempt.
#[derive(Debug, Clone, Default)]
pub struct StartNodeOptions {
    pub timeout_ms: Option<u64>,
    pub connector_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub request_hash: Option<String>,
}

/// The write path over an [`ExecutionStore`].
pub struct RunExecutionManager {
    store: Arc<dyn ExecutionStore>,
    retention: chrono::Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RunExecutionManager {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            retention: DEFAULT_RETENTION,
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Persist a freshly-admitted execution row.
    pub async fn create_execution(&self, execution: Execution) -> RunStoreResult<()> {
        debug!(execution_id = %execution.id, status = %execution.status, "creating execution row");
        self.store.insert_execution(execution).await
    }

    /// Transition `queued → running` and stamp the lease.
    pub async fn mark_running(&self, id: Uuid, lease: Lease) -> RunStoreResult<Execution> {
        let mut execution = self.require(id).await?;
        if execution.status.is_terminal() {
            return Err(RunStoreError::Other(format!(
                "execution {} is already {}",
                id, execution.status
            )));
        }
        execution.status = ExecutionStatus::Running;
        execution.metadata.lease = Some(lease);
        execution.timeline_push(
            TimelineEvent::new(TimelineEventKind::ExecutionStarted)
                .with_attr("workflow_id", execution.workflow_id.clone()),
        );
        self.store.update_execution(execution.clone()).await?;
        Ok(execution)
    }

    /// Create the attempt row for one node invocation.
    pub async fn start_node(
        &self,
        execution_id: Uuid,
        node: &WorkflowNode,
        input: Value,
        attempt: u32,
        opts: StartNodeOptions,
    ) -> RunStoreResult<NodeAttempt> {
        let attempt_row = NodeAttempt {
            execution_id,
            node_id: node.id.clone(),
            attempt,
            status: AttemptStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            input: sanitize(&input),
            output: None,
            error: None,
            retry_history: Vec::new(),
            metadata: AttemptMetadata {
                idempotency_key: opts.idempotency_key,
                request_hash: opts.request_hash,
                connector_id: opts.connector_id,
                timeout_ms: opts.timeout_ms,
                ..Default::default()
            },
            timeline: vec![
                TimelineEvent::new(TimelineEventKind::NodeStarted)
                    .with_attr("node_id", node.id.clone())
                    .with_attr("label", node.label.clone()),
            ],
        };
        self.store.put_attempt(attempt_row.clone()).await?;

        let mut execution = self.require(execution_id).await?;
        execution.timeline_push(
            TimelineEvent::new(TimelineEventKind::NodeStarted)
                .with_attr("node_id", node.id.clone())
                .with_attr("attempt", attempt),
        );
        self.store.update_execution(execution).await?;
        Ok(attempt_row)
    }

    /// Stamp success on the latest attempt and fold usage into rollups.
    pub async fn complete_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        output: Value,
        metadata: AttemptMetadata,
    ) -> RunStoreResult<()> {
        let mut attempt = self.latest_attempt(execution_id, node_id).await?;
        let ended = Utc::now();
        let duration_ms = (ended - attempt.started_at).num_milliseconds().max(0) as u64;
        attempt.status = AttemptStatus::Succeeded;
        attempt.ended_at = Some(ended);
        attempt.output = Some(sanitize(&output));
        attempt.metadata = metadata.clone();
        attempt.timeline.push(
            TimelineEvent::new(TimelineEventKind::NodeCompleted)
                .with_attr("duration_ms", duration_ms),
        );
        self.store.put_attempt(attempt).await?;

        let mut execution = self.require(execution_id).await?;
        execution
            .node_outputs
            .insert(node_id.to_string(), sanitize(&output));
        let usage = &mut execution.metadata.usage;
        usage.completed_nodes += 1;
        usage.total_node_duration_ms += duration_ms;
        usage.cache_lookups += 1;
        if metadata.cache_hit {
            usage.cache_hits += 1;
        }
        if let Some(cost) = metadata.cost {
            usage.total_cost += cost;
        }
        if let Some(tokens) = metadata.tokens {
            usage.total_tokens += tokens;
        }
        if let Some(key) = metadata.idempotency_key {
            execution
                .metadata
                .deterministic_keys
                .idempotency
                .insert(node_id.to_string(), key);
        }
        if let Some(hash) = metadata.request_hash {
            execution
                .metadata
                .deterministic_keys
                .request_hashes
                .insert(node_id.to_string(), hash);
        }
        execution.timeline_push(
            TimelineEvent::new(TimelineEventKind::NodeCompleted)
                .with_attr("node_id", node_id)
                .with_attr("duration_ms", duration_ms),
        );
        self.store.update_execution(execution).await
    }

    /// Stamp failure on the latest attempt.
    pub async fn fail_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        error: ErrorDetails,
        metadata: AttemptMetadata,
    ) -> RunStoreResult<()> {
        let mut attempt = self.latest_attempt(execution_id, node_id).await?;
        attempt.status = AttemptStatus::Failed;
        attempt.ended_at = Some(Utc::now());
        attempt.error = Some(error.clone());
        attempt.metadata = metadata;
        attempt.timeline.push(
            TimelineEvent::new(TimelineEventKind::NodeFailed)
                .with_attr("code", error.code.to_string()),
        );
        self.store.put_attempt(attempt).await?;

        let mut execution = self.require(execution_id).await?;
        execution.timeline_push(
            TimelineEvent::new(TimelineEventKind::NodeFailed)
                .with_attr("node_id", node_id)
                .with_attr("code", error.code.to_string())
                .with_attr("message", truncate(&error.message)),
        );
        self.store.update_execution(execution).await
    }

    /// Transition to `waiting` and persist the resume snapshot.
    pub async fn mark_waiting(
        &self,
        id: Uuid,
        reason: &str,
        resume_at: Option<DateTime<Utc>>,
        resume_state: ResumeState,
    ) -> RunStoreResult<()> {
        let mut execution = self.require(id).await?;
        execution.status = ExecutionStatus::Waiting;
        execution.metadata.wait_until = resume_at;
        execution.metadata.resume_state = Some(resume_state);
        execution.timeline_push(
            TimelineEvent::new(TimelineEventKind::ExecutionWaiting)
                .with_attr("reason", reason)
                .with_attr(
                    "resume_at",
                    resume_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                ),
        );
        info!(execution_id = %id, reason, "execution suspended");
        self.store.update_execution(execution).await
    }

    /// Terminal transition.
    pub async fn complete_execution(
        &self,
        id: Uuid,
        output: Option<Value>,
        error: Option<ErrorDetails>,
    ) -> RunStoreResult<Execution> {
        let mut execution = self.require(id).await?;
        let now = Utc::now();
        execution.status = if error.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        execution.completed_at = Some(now);
        execution.duration_ms =
            Some((now - execution.started_at).num_milliseconds().max(0) as u64);
        execution.error = error.clone();
        if let Some(output) = output {
            execution
                .node_outputs
                .insert("__result".to_string(), sanitize(&output));
        }
        execution.metadata.lease = None;
        execution.timeline_push(
            TimelineEvent::new(TimelineEventKind::ExecutionCompleted)
                .with_attr("status", execution.status.to_string()),
        );
        info!(
            execution_id = %id,
            status = %execution.status,
            duration_ms = execution.duration_ms.unwrap_or(0),
            "execution finished"
        );
        self.store.update_execution(execution.clone()).await?;
        Ok(execution)
    }

    /// Put a running execution back in the queueable state after a
    /// job-level failure that the queue will redeliver. The error is kept
    /// on the row so observers see why the pass failed; the terminal
    /// `failed` status is reserved for the final delivery.
    pub async fn mark_queued_for_retry(
        &self,
        id: Uuid,
        error: ErrorDetails,
    ) -> RunStoreResult<()> {
        let mut execution = self.require(id).await?;
        if execution.status.is_terminal() {
            return Ok(());
        }
        execution.status = ExecutionStatus::Queued;
        execution.error = Some(error);
        execution.metadata.lease = None;
        self.store.update_execution(execution).await
    }

    /// Persist the current lease back to the row (heartbeat persistence).
    pub async fn persist_lease(&self, id: Uuid, lease: Lease) -> RunStoreResult<()> {
        let mut execution = self.require(id).await?;
        execution.metadata.lease = Some(lease);
        self.store.update_execution(execution).await
    }

    /// Persist arbitrary metadata mutations (callback URLs, fallback
    /// reasons, circuit snapshots).
    pub async fn update_metadata(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut Execution),
    ) -> RunStoreResult<Execution> {
        let mut execution = self.require(id).await?;
        mutate(&mut execution);
        self.store.update_execution(execution.clone()).await?;
        Ok(execution)
    }

    pub async fn get(&self, id: Uuid) -> RunStoreResult<Option<Execution>> {
        self.store.get_execution(id).await
    }

    pub async fn by_correlation(&self, correlation_id: &str) -> RunStoreResult<Option<Execution>> {
        self.store.find_by_correlation(correlation_id).await
    }

    pub async fn list(&self, query: &ExecutionQuery) -> RunStoreResult<Vec<Execution>> {
        self.store.list_executions(query).await
    }

    /// Aggregate stats bucketed by hour/day/week over a window.
    pub async fn stats(
        &self,
        bucket: StatsBucket,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RunStoreResult<ExecutionStats> {
        let executions = self
            .store
            .list_executions(&ExecutionQuery {
                date_from: Some(from),
                date_to: Some(to),
                ..Default::default()
            })
            .await?;

        let width = bucket.width();
        let mut entries: Vec<StatsEntry> = Vec::new();
        let mut start = from;
        while start < to {
            let end = start + width;
            let in_bucket: Vec<&Execution> = executions
                .iter()
                .filter(|e| e.started_at >= start && e.started_at < end)
                .collect();
            if !in_bucket.is_empty() {
                let completed = in_bucket
                    .iter()
                    .filter(|e| e.status == ExecutionStatus::Completed)
                    .count();
                let failed = in_bucket
                    .iter()
                    .filter(|e| e.status == ExecutionStatus::Failed)
                    .count();
                let waiting = in_bucket
                    .iter()
                    .filter(|e| e.status == ExecutionStatus::Waiting)
                    .count();
                let durations: Vec<u64> =
                    in_bucket.iter().filter_map(|e| e.duration_ms).collect();
                let avg_duration_ms = if durations.is_empty() {
                    0.0
                } else {
                    durations.iter().sum::<u64>() as f64 / durations.len() as f64
                };
                entries.push(StatsEntry {
                    bucket_start: start,
                    total: in_bucket.len(),
                    completed,
                    failed,
                    waiting,
                    avg_duration_ms,
                    total_cost: in_bucket.iter().map(|e| e.metadata.usage.total_cost).sum(),
                    total_tokens: in_bucket
                        .iter()
                        .map(|e| e.metadata.usage.total_tokens)
                        .sum(),
                });
            }
            start = end;
        }
        Ok(ExecutionStats { bucket, entries })
    }

    /// Spawn the retention sweeper (every 2h).
    pub fn start_retention_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2 * 3_600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - manager.retention;
                match manager.store.delete_older_than(cutoff).await {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "retention sweep removed old executions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "retention sweep failed"),
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    pub fn stop_retention_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    async fn require(&self, id: Uuid) -> RunStoreResult<Execution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or(RunStoreError::ExecutionNotFound(id))
    }

    async fn latest_attempt(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> RunStoreResult<NodeAttempt> {
        self.store
            .get_attempts(execution_id, node_id)
            .await?
            .into_iter()
            .max_by_key(|a| a.attempt)
            .ok_or_else(|| RunStoreError::AttemptNotFound {
                execution_id,
                node_id: node_id.to_string(),
            })
    }
}

/// Mask credential-shaped content and cap value sizes before persistence.
fn sanitize(value: &Value) -> Value {
    let redactor = Redactor::from_context(&[value], &[]);
    cap_value(&redactor.redact_value(value))
}

fn cap_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.len() > TIMELINE_VALUE_CAP => {
            Value::String(format!("{}…[truncated]", &s[..TIMELINE_VALUE_CAP]))
        }
        Value::Array(items) => Value::Array(items.iter().map(cap_value).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), cap_value(v))).collect())
        }
        other => other.clone(),
    }
}

fn truncate(s: &str) -> String {
    if s.len() > 512 {
        format!("{}…", &s[..512])
    } else {
        s.to_string()
    }
}

/// Small helper so timeline pushes read naturally at call sites.
trait TimelineExt {
    fn timeline_push(&mut self, event: TimelineEvent);
}

impl TimelineExt for Execution {
    fn timeline_push(&mut self, event: TimelineEvent) {
        self.metadata.timeline.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_kernel::{NodeKind, TriggerType};
    use serde_json::json;

    async fn setup() -> (Arc<RunExecutionManager>, Execution) {
        let manager = Arc::new(RunExecutionManager::new(Arc::new(
            MemoryExecutionStore::new(),
        )));
        let execution = Execution::new("wf-1", "org-1", None, TriggerType::Manual, json!({}));
        manager.create_execution(execution.clone()).await.unwrap();
        (manager, execution)
    }

    fn lease() -> Lease {
        let now = Utc::now();
        Lease {
            worker_id: "w1".into(),
            locked_at: now,
            lock_expires_at: now + chrono::Duration::seconds(60),
            heartbeat_interval_ms: 5_000,
            last_heartbeat_at: now,
            renew_count: 0,
        }
    }

    #[tokio::test]
    async fn lifecycle_updates_rollups_and_keys() {
        let (manager, execution) = setup().await;
        let node = WorkflowNode::new("n1", "First", NodeKind::Transform);

        manager.mark_running(execution.id, lease()).await.unwrap();
        manager
            .start_node(
                execution.id,
                &node,
                json!({"in": 1}),
                1,
                StartNodeOptions {
                    idempotency_key: Some("idk_a".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        manager
            .complete_node(
                execution.id,
                "n1",
                json!({"out": 2}),
                AttemptMetadata {
                    idempotency_key: Some("idk_a".into()),
                    request_hash: Some("rh_a".into()),
                    cost: Some(0.25),
                    tokens: Some(120),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let done = manager
            .complete_execution(execution.id, Some(json!({"out": 2})), None)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.node_outputs["n1"], json!({"out": 2}));
        assert_eq!(done.metadata.usage.completed_nodes, 1);
        assert!((done.metadata.usage.total_cost - 0.25).abs() < f64::EPSILON);
        assert_eq!(done.metadata.usage.total_tokens, 120);
        assert_eq!(done.metadata.deterministic_keys.idempotency["n1"], "idk_a");
        assert_eq!(
            done.metadata.deterministic_keys.request_hashes["n1"],
            "rh_a"
        );
        assert!(done.duration_ms.is_some());
    }

    #[tokio::test]
    async fn failed_node_marks_execution_failed_with_details() {
        let (manager, execution) = setup().await;
        let node = WorkflowNode::new("n1", "Flaky", NodeKind::Http);

        manager.mark_running(execution.id, lease()).await.unwrap();
        manager
            .start_node(execution.id, &node, json!({}), 1, StartNodeOptions::default())
            .await
            .unwrap();
        manager
            .fail_node(
                execution.id,
                "n1",
                ErrorDetails::new(millrace_kernel::ErrorCode::Timeout, "timed out").for_node("n1"),
                AttemptMetadata::default(),
            )
            .await
            .unwrap();

        let failed = manager
            .complete_execution(
                execution.id,
                None,
                Some(ErrorDetails::new(
                    millrace_kernel::ErrorCode::Timeout,
                    "Node \"Flaky\" failed: timed out",
                )),
            )
            .await
            .unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(failed.error.is_some());

        let attempts = manager
            .store()
            .get_attempts(execution.id, "n1")
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn waiting_persists_resume_state() {
        let (manager, execution) = setup().await;
        let mut resume = ResumeState::new(execution.started_at);
        resume.remaining_node_ids = vec!["n2".into()];
        resume.idempotency_keys.insert("n1".into(), "idk_a".into());

        manager
            .mark_waiting(
                execution.id,
                "delay",
                Some(Utc::now() + chrono::Duration::seconds(30)),
                resume,
            )
            .await
            .unwrap();

        let row = manager.get(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Waiting);
        let stored = row.metadata.resume_state.unwrap();
        assert_eq!(stored.remaining_node_ids, vec!["n2"]);
        assert_eq!(stored.idempotency_keys["n1"], "idk_a");
    }

    #[tokio::test]
    async fn sanitizes_credentials_in_persisted_values() {
        let (manager, execution) = setup().await;
        let node = WorkflowNode::new("n1", "Secretive", NodeKind::Http);
        manager.mark_running(execution.id, lease()).await.unwrap();
        manager
            .start_node(
                execution.id,
                &node,
                json!({"credentials": {"api_key": "sk-very-secret"}, "url": "https://x"}),
                1,
                StartNodeOptions::default(),
            )
            .await
            .unwrap();

        let attempts = manager
            .store()
            .get_attempts(execution.id, "n1")
            .await
            .unwrap();
        assert_eq!(
            attempts[0].input["credentials"]["api_key"],
            millrace_sandbox::REDACTED
        );
        assert_eq!(attempts[0].input["url"], "https://x");
    }

    #[tokio::test]
    async fn stats_bucket_by_day() {
        let (manager, _) = setup().await;
        let now = Utc::now();
        for i in 0..3 {
            let mut e = Execution::new("wf-s", "org-1", None, TriggerType::Manual, json!({}));
            e.status = ExecutionStatus::Completed;
            e.started_at = now - chrono::Duration::hours(2) + chrono::Duration::minutes(i);
            e.duration_ms = Some(1_000 + i as u64);
            manager.create_execution(e).await.unwrap();
        }

        let stats = manager
            .stats(
                StatsBucket::Day,
                now - chrono::Duration::days(1),
                now + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        let total: usize = stats.entries.iter().map(|e| e.total).sum();
        assert_eq!(total, 3);
        let completed: usize = stats.entries.iter().map(|e| e.completed).sum();
        assert_eq!(completed, 3);
    }
}
