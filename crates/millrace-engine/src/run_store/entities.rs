//! Query and stats types for the run-state store.

use chrono::{DateTime, Utc};
use millrace_kernel::ExecutionStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Run-state store errors.
#[derive(Debug, Clone, Error)]
pub enum RunStoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(uuid::Uuid),
    #[error("node attempt not found: {execution_id}/{node_id}")]
    AttemptNotFound {
        execution_id: uuid::Uuid,
        node_id: String,
    },
    /// A second `running` attempt for the same `(execution, node)`.
    #[error("node {node_id} already has a running attempt in execution {execution_id}")]
    AttemptAlreadyRunning {
        execution_id: uuid::Uuid,
        node_id: String,
    },
    #[error("timer not found: {0}")]
    TimerNotFound(uuid::Uuid),
    #[error("resume token invalid: {0}")]
    TokenInvalid(String),
    #[error("store error: {0}")]
    Other(String),
}

pub type RunStoreResult<T> = Result<T, RunStoreError>;

/// Sort order for execution listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSort {
    #[default]
    StartedAtDesc,
    StartedAtAsc,
    DurationDesc,
}

/// Filtered listing query.
#[derive(Debug, Clone, Default)]
pub struct ExecutionQuery {
    pub workflow_id: Option<String>,
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Vec<ExecutionStatus>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub sort: ExecutionSort,
    pub limit: usize,
    pub offset: usize,
}

impl ExecutionQuery {
    pub fn for_workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            limit: 50,
            ..Default::default()
        }
    }
}

/// Aggregation bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsBucket {
    Hour,
    Day,
    Week,
}

impl StatsBucket {
    pub fn width(&self) -> chrono::Duration {
        match self {
            StatsBucket::Hour => chrono::Duration::hours(1),
            StatsBucket::Day => chrono::Duration::days(1),
            StatsBucket::Week => chrono::Duration::weeks(1),
        }
    }
}

/// One aggregated bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsEntry {
    pub bucket_start: DateTime<Utc>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub waiting: usize,
    pub avg_duration_ms: f64,
    pub total_cost: f64,
    pub total_tokens: u64,
}

/// Aggregated stats over a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub bucket: StatsBucket,
    pub entries: Vec<StatsEntry>,
}
