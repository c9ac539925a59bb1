//! Execution queue abstraction
//!
//! One queue per region, jobs grouped by tenant. The in-memory driver in
//! [`memory`] is the reference implementation; a durable driver is injected
//! by the host process behind the same trait.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Region;
use crate::execution::{ResumeState, TriggerType};

/// Queue operation errors.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    /// The caller's lease is stale; another worker owns the job now.
    #[error("job {job_id} is not leased by worker {worker_id}")]
    NotLeaseHolder { job_id: Uuid, worker_id: String },
    #[error("queue is shut down")]
    Closed,
    #[error("queue error: {0}")]
    Other(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Payload of a main-queue job. Carries everything a worker needs to run
/// or resume an execution without further lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub trigger_type: TriggerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<ResumeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token_id: Option<Uuid>,
    pub connectors: Vec<String>,
    pub region: Region,
}

/// Options for [`ExecutionQueue::add`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Stable job id; re-adding the same id is a no-op (dedupe).
    pub job_id: Uuid,
    /// Tenant group key for fair dispatch.
    pub group: String,
}

/// A job claimed by a worker, with its lease.
#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub job_id: Uuid,
    pub payload: JobPayload,
    pub group: String,
    /// 1-based delivery counter; > 1 means the job was redelivered.
    pub delivery: u32,
    pub lock_expires_at: DateTime<Utc>,
}

/// Aggregate queue depth counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: usize,
}

/// Region-local, tenant-grouped job queue with leases.
#[async_trait]
pub trait ExecutionQueue: Send + Sync {
    /// Enqueue a job. Duplicate `job_id`s are dropped silently.
    async fn add(&self, payload: JobPayload, opts: EnqueueOptions) -> QueueResult<()>;

    /// Claim the next job this worker may run, honoring per-tenant caps.
    /// Returns `None` when nothing is currently eligible.
    async fn reserve(&self, worker_id: &str) -> QueueResult<Option<ReservedJob>>;

    /// Extend the lease on a held job. Fails if the lease was lost.
    async fn renew(&self, job_id: Uuid, worker_id: &str) -> QueueResult<DateTime<Utc>>;

    /// Acknowledge successful completion and release the lease.
    async fn complete(&self, job_id: Uuid, worker_id: &str) -> QueueResult<()>;

    /// Report failure. The job is redelivered after `backoff` until its
    /// delivery budget is exhausted, then dead-lettered.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: Duration,
    ) -> QueueResult<()>;

    /// Current queue depth counters.
    async fn counts(&self) -> QueueCounts;
}

/// Blanket impl so `Arc<Q>` is usable wherever a queue is expected.
#[async_trait]
impl<Q: ExecutionQueue + ?Sized> ExecutionQueue for std::sync::Arc<Q> {
    async fn add(&self, payload: JobPayload, opts: EnqueueOptions) -> QueueResult<()> {
        (**self).add(payload, opts).await
    }

    async fn reserve(&self, worker_id: &str) -> QueueResult<Option<ReservedJob>> {
        (**self).reserve(worker_id).await
    }

    async fn renew(&self, job_id: Uuid, worker_id: &str) -> QueueResult<DateTime<Utc>> {
        (**self).renew(job_id, worker_id).await
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> QueueResult<()> {
        (**self).complete(job_id, worker_id).await
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: Duration,
    ) -> QueueResult<()> {
        (**self).fail(job_id, worker_id, error, backoff).await
    }

    async fn counts(&self) -> QueueCounts {
        (**self).counts().await
    }
}
