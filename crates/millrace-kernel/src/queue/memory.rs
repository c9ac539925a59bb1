//! In-memory execution queue
//!
//! Per-tenant FIFO lanes with round-robin dispatch across tenants, lease
//! expiry reclaim, delayed redelivery with backoff, and a delivery budget
//! after which jobs are dead-lettered. Single-process only; the durable
//! driver replaces this in multi-worker deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    EnqueueOptions, ExecutionQueue, JobPayload, QueueCounts, QueueError, QueueResult, ReservedJob,
};

/// Tunables for the in-memory driver.
#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    pub lease_duration: Duration,
    /// Per-tenant in-flight ceiling (T).
    pub tenant_concurrency: usize,
    /// Total deliveries per job (`max_retries + 1`).
    pub max_deliveries: u32,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_millis(60_000),
            tenant_concurrency: 4,
            max_deliveries: 4,
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedJob {
    job_id: Uuid,
    payload: JobPayload,
    group: String,
    /// Deliveries consumed so far.
    deliveries: u32,
}

#[derive(Debug)]
struct ActiveJob {
    job: QueuedJob,
    worker_id: String,
    lock_expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct DelayedJob {
    job: QueuedJob,
    ready_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<String, VecDeque<QueuedJob>>,
    /// Round-robin rotation over groups that have waiting jobs.
    rotation: VecDeque<String>,
    active: HashMap<Uuid, ActiveJob>,
    delayed: Vec<DelayedJob>,
    in_flight: HashMap<String, usize>,
    /// Job ids currently anywhere in the queue, for enqueue dedupe.
    known: HashSet<Uuid>,
    completed: usize,
    dead_lettered: usize,
}

impl QueueState {
    fn push_waiting(&mut self, job: QueuedJob, front: bool) {
        let group = job.group.clone();
        let lane = self.lanes.entry(group.clone()).or_default();
        let was_empty = lane.is_empty();
        if front {
            lane.push_front(job);
        } else {
            lane.push_back(job);
        }
        if was_empty && !self.rotation.contains(&group) {
            self.rotation.push_back(group);
        }
    }
}

/// In-memory, tenant-fair execution queue.
pub struct InMemoryExecutionQueue {
    config: MemoryQueueConfig,
    state: Mutex<QueueState>,
}

impl InMemoryExecutionQueue {
    pub fn new(config: MemoryQueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Move due delayed jobs back into their lanes and reclaim expired
    /// leases. Called at the top of every reserve.
    fn sweep(&self, state: &mut QueueState, now: DateTime<Utc>) {
        let mut due = Vec::new();
        state.delayed.retain(|d| {
            if d.ready_at <= now {
                due.push(d.job.clone());
                false
            } else {
                true
            }
        });
        for job in due {
            state.push_waiting(job, false);
        }

        let expired: Vec<Uuid> = state
            .active
            .iter()
            .filter(|(_, a)| a.lock_expires_at < now)
            .map(|(id, _)| *id)
            .collect();
        for job_id in expired {
            if let Some(active) = state.active.remove(&job_id) {
                let group = active.job.group.clone();
                if let Some(n) = state.in_flight.get_mut(&group) {
                    *n = n.saturating_sub(1);
                }
                warn!(
                    job_id = %job_id,
                    worker_id = %active.worker_id,
                    group = %group,
                    "lease expired, reclaiming job"
                );
                if active.job.deliveries >= self.config.max_deliveries {
                    state.known.remove(&job_id);
                    state.dead_lettered += 1;
                } else {
                    // Reclaimed jobs go to the front: the execution already
                    // holds a running slot's worth of partial work.
                    state.push_waiting(active.job, true);
                }
            }
        }
    }
}

#[async_trait]
impl ExecutionQueue for InMemoryExecutionQueue {
    async fn add(&self, payload: JobPayload, opts: EnqueueOptions) -> QueueResult<()> {
        let mut state = self.state.lock();
        if !state.known.insert(opts.job_id) {
            debug!(job_id = %opts.job_id, "duplicate enqueue ignored");
            return Ok(());
        }
        state.push_waiting(
            QueuedJob {
                job_id: opts.job_id,
                payload,
                group: opts.group,
                deliveries: 0,
            },
            false,
        );
        Ok(())
    }

    async fn reserve(&self, worker_id: &str) -> QueueResult<Option<ReservedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        self.sweep(&mut state, now);

        // Round-robin over tenant lanes, skipping tenants at their cap.
        let rotation_len = state.rotation.len();
        for _ in 0..rotation_len {
            let Some(group) = state.rotation.pop_front() else {
                break;
            };
            let at_cap =
                state.in_flight.get(&group).copied().unwrap_or(0) >= self.config.tenant_concurrency;
            let lane_empty = state.lanes.get(&group).is_none_or(VecDeque::is_empty);

            if at_cap || lane_empty {
                if !lane_empty {
                    state.rotation.push_back(group);
                }
                continue;
            }

            let mut job = state
                .lanes
                .get_mut(&group)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| QueueError::Other("lane disappeared".into()))?;
            if state.lanes.get(&group).is_some_and(|l| !l.is_empty()) {
                state.rotation.push_back(group.clone());
            }

            job.deliveries += 1;
            *state.in_flight.entry(group.clone()).or_insert(0) += 1;
            let lock_expires_at = now
                + chrono::Duration::from_std(self.config.lease_duration)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            let reserved = ReservedJob {
                job_id: job.job_id,
                payload: job.payload.clone(),
                group: group.clone(),
                delivery: job.deliveries,
                lock_expires_at,
            };
            state.active.insert(
                job.job_id,
                ActiveJob {
                    job,
                    worker_id: worker_id.to_string(),
                    lock_expires_at,
                },
            );
            return Ok(Some(reserved));
        }

        Ok(None)
    }

    async fn renew(&self, job_id: Uuid, worker_id: &str) -> QueueResult<DateTime<Utc>> {
        let mut state = self.state.lock();
        let active = state.active.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if active.worker_id != worker_id {
            return Err(QueueError::NotLeaseHolder {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        let new_expiry = Utc::now()
            + chrono::Duration::from_std(self.config.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        active.lock_expires_at = new_expiry;
        Ok(new_expiry)
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> QueueResult<()> {
        let mut state = self.state.lock();
        match state.active.get(&job_id) {
            None => return Err(QueueError::NotFound(job_id)),
            Some(active) if active.worker_id != worker_id => {
                return Err(QueueError::NotLeaseHolder {
                    job_id,
                    worker_id: worker_id.to_string(),
                });
            }
            Some(_) => {}
        }
        let active = state
            .active
            .remove(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if let Some(n) = state.in_flight.get_mut(&active.job.group) {
            *n = n.saturating_sub(1);
        }
        state.known.remove(&job_id);
        state.completed += 1;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        backoff: Duration,
    ) -> QueueResult<()> {
        let mut state = self.state.lock();
        match state.active.get(&job_id) {
            None => return Err(QueueError::NotFound(job_id)),
            Some(active) if active.worker_id != worker_id => {
                return Err(QueueError::NotLeaseHolder {
                    job_id,
                    worker_id: worker_id.to_string(),
                });
            }
            Some(_) => {}
        }
        let active = state
            .active
            .remove(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if let Some(n) = state.in_flight.get_mut(&active.job.group) {
            *n = n.saturating_sub(1);
        }

        if active.job.deliveries >= self.config.max_deliveries {
            warn!(job_id = %job_id, error = %error, "delivery budget exhausted, dead-lettering");
            state.known.remove(&job_id);
            state.dead_lettered += 1;
        } else {
            debug!(
                job_id = %job_id,
                delivery = active.job.deliveries,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "job failed, scheduling redelivery"
            );
            state.delayed.push(DelayedJob {
                job: active.job,
                ready_at: Utc::now()
                    + chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            });
        }
        Ok(())
    }

    async fn counts(&self) -> QueueCounts {
        let state = self.state.lock();
        QueueCounts {
            waiting: state.lanes.values().map(VecDeque::len).sum(),
            active: state.active.len(),
            completed: state.completed,
            failed: state.dead_lettered,
            delayed: state.delayed.len(),
            paused: 0,
        }
    }
}
