//! Execution data model
//!
//! Everything the run-state store persists: executions, per-node attempts,
//! resume snapshots, timers, leases and timeline events. All of it is
//! serde-stable; `ResumeState` in particular must round-trip unchanged
//! across engine versions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::Region;
use crate::error::ErrorCode;

/// How a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Webhook,
    Schedule,
    Callback,
    Replay,
}

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Waiting,
    Completed,
    Failed,
    Partial,
}

impl ExecutionStatus {
    /// Terminal statuses never transition back; replay creates a new row.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Partial
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Partial => "partial",
        };
        write!(f, "{}", s)
    }
}

/// Structured error attached to a failed execution or attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_id: None,
            attempts: None,
        }
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Per-tenant execution limits resolved at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantLimits {
    pub max_concurrent_executions: u32,
    pub max_executions_per_minute: u32,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            max_executions_per_minute: 60,
        }
    }
}

/// Admission snapshot persisted into execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub running_before_enqueue: u32,
    pub window_count: u32,
    pub window_start: DateTime<Utc>,
    pub limits: TenantLimits,
}

/// Time-bounded claim on a queue job, extended by heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub locked_at: DateTime<Utc>,
    pub lock_expires_at: DateTime<Utc>,
    pub heartbeat_interval_ms: u64,
    pub last_heartbeat_at: DateTime<Utc>,
    pub renew_count: u32,
}

impl Lease {
    /// Expired leases are eligible for rescue by another worker.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.lock_expires_at
    }
}

/// Deterministic keys captured while the execution ran; replays and resumes
/// read these before ever calling the key generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeterministicKeys {
    /// nodeId → idempotency key
    pub idempotency: HashMap<String, String>,
    /// nodeId → request hash
    pub request_hashes: HashMap<String, String>,
}

/// Cost/token rollups accumulated across node attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRollup {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub cache_hits: u32,
    pub cache_lookups: u32,
    pub completed_nodes: u32,
    pub total_node_duration_ms: u64,
    pub open_breakers: u32,
}

impl UsageRollup {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.cache_lookups == 0 {
            0.0
        } else {
            f64::from(self.cache_hits) / f64::from(self.cache_lookups)
        }
    }

    pub fn avg_node_duration_ms(&self) -> f64 {
        if self.completed_nodes == 0 {
            0.0
        } else {
            self.total_node_duration_ms as f64 / f64::from(self.completed_nodes)
        }
    }
}

/// Everything about an execution that is not a first-class column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    pub deterministic_keys: DeterministicKeys,
    /// nodeId → attempts consumed so far
    pub retry_counts: HashMap<String, u32>,
    /// connectorId/nodeId → last observed breaker snapshot
    pub circuit_snapshots: HashMap<String, Value>,
    pub usage: UsageRollup,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,
    /// Snapshot for the next resume, written whenever the execution suspends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<ResumeState>,
    /// Execution-level timeline, appended by the run-state store.
    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed_from: Option<Uuid>,
    /// nodeId → reason the generic fallback path was taken
    pub fallback_reasons: HashMap<String, String>,
}

/// One run of a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: String,
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    pub node_outputs: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    pub correlation_id: String,
    pub tags: Vec<String>,
    pub metadata: ExecutionMetadata,
}

impl Execution {
    pub fn new(
        workflow_id: impl Into<String>,
        organization_id: impl Into<String>,
        user_id: Option<String>,
        trigger_type: TriggerType,
        trigger_data: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            organization_id: organization_id.into(),
            user_id,
            status: ExecutionStatus::Queued,
            started_at: now,
            completed_at: None,
            duration_ms: None,
            trigger_type,
            trigger_data,
            node_outputs: HashMap::new(),
            error: None,
            correlation_id: new_correlation_id(),
            tags: Vec::new(),
            metadata: ExecutionMetadata {
                queued_at: Some(now),
                ..Default::default()
            },
        }
    }
}

/// `corr_<epoch-ms>_<rand>` — sortable and unique enough for log joins.
pub fn new_correlation_id() -> String {
    let epoch_ms = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0x1000_0000..0xffff_ffff);
    format!("corr_{}_{:08x}", epoch_ms, suffix)
}

/// Node attempt lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
    Retrying,
    Dlq,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Succeeded | AttemptStatus::Failed | AttemptStatus::Dlq
        )
    }
}

/// One entry in an attempt's retry history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEvent {
    pub attempt: u32,
    pub error: String,
    pub classified: ErrorCode,
    pub at: DateTime<Utc>,
    pub delay_ms: u64,
}

/// Attempt-level metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// One invocation of one node within an execution.
///
/// Primary key `(execution_id, node_id, attempt)`; the store enforces at
/// most one `Running` attempt per `(execution_id, node_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAttempt {
    pub execution_id: Uuid,
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    pub retry_history: Vec<RetryEvent>,
    pub metadata: AttemptMetadata,
    pub timeline: Vec<TimelineEvent>,
}

/// Timeline event kinds appended by the run-state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    ExecutionStarted,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    ExecutionWaiting,
    ExecutionCompleted,
}

/// A single timeline entry with sanitized attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub kind: TimelineEventKind,
    pub at: DateTime<Utc>,
    pub attributes: serde_json::Map<String, Value>,
}

impl TimelineEvent {
    pub fn new(kind: TimelineEventKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Snapshot written when an execution suspends.
///
/// On resume, the scheduler reads `idempotency_keys`/`request_hashes`
/// before generating anything, so keys for already-executed nodes come out
/// byte-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeState {
    pub node_outputs: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_output: Option<Value>,
    pub remaining_node_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub idempotency_keys: HashMap<String, String>,
    pub request_hashes: HashMap<String, String>,
}

impl ResumeState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            ..Default::default()
        }
    }
}

/// Workflow timer lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// Durable timer scheduled by a delay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTimer {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub resume_at: DateTime<Utc>,
    pub payload: TimerPayload,
    pub status: TimerStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Serialized resume context carried by a timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerPayload {
    pub workflow_id: String,
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub resume_state: ResumeState,
    pub connectors: Vec<String>,
}

/// One-time token for callback-driven resumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeToken {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl ResumeToken {
    pub fn new(execution_id: Uuid, node_id: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.into(),
            expires_at,
            consumed: false,
        }
    }

    /// The callback URL written into execution metadata.
    pub fn callback_path(&self) -> String {
        format!("/executions/{}/callbacks/{}", self.execution_id, self.id)
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && now <= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Partial.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
        assert!(!ExecutionStatus::Queued.is_terminal());
    }

    #[test]
    fn correlation_id_shape() {
        let id = new_correlation_id();
        assert!(id.starts_with("corr_"));
        assert_eq!(id.split('_').count(), 3);
    }

    #[test]
    fn lease_expiry() {
        let now = Utc::now();
        let lease = Lease {
            worker_id: "w1".into(),
            locked_at: now,
            lock_expires_at: now + chrono::Duration::seconds(60),
            heartbeat_interval_ms: 5_000,
            last_heartbeat_at: now,
            renew_count: 0,
        };
        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn resume_state_round_trips() {
        let mut state = ResumeState::new(Utc::now());
        state.node_outputs.insert("a".into(), json!({"v": 1}));
        state.remaining_node_ids = vec!["b".into(), "c".into()];
        state.next_node_id = Some("b".into());
        state.idempotency_keys.insert("a".into(), "idk_abc".into());
        state.request_hashes.insert("a".into(), "deadbeef".into());

        let serialized = serde_json::to_string(&state).unwrap();
        let restored: ResumeState = serde_json::from_str(&serialized).unwrap();
        assert_eq!(restored.remaining_node_ids, state.remaining_node_ids);
        assert_eq!(restored.idempotency_keys["a"], "idk_abc");
        assert_eq!(restored.node_outputs["a"], json!({"v": 1}));
    }

    #[test]
    fn resume_token_usability() {
        let now = Utc::now();
        let mut token = ResumeToken::new(Uuid::new_v4(), "n1", now + chrono::Duration::minutes(5));
        assert!(token.is_usable(now));
        assert!(!token.is_usable(now + chrono::Duration::minutes(6)));
        token.consumed = true;
        assert!(!token.is_usable(now));
    }

    #[test]
    fn usage_rollup_rates() {
        let rollup = UsageRollup {
            cache_hits: 3,
            cache_lookups: 4,
            completed_nodes: 2,
            total_node_duration_ms: 300,
            ..Default::default()
        };
        assert!((rollup.cache_hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((rollup.avg_node_duration_ms() - 150.0).abs() < f64::EPSILON);
    }
}
