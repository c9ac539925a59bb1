//! Worker loop
//!
//! One task per worker slot: claim a job off the region queue, take a
//! running slot with bounded backoff, stamp the lease, pump heartbeats,
//! run the node loop, and apply the failure-disposition table. Workers
//! must assume their job can be reassigned under them: lease loss aborts
//! the pass quietly and the queue redelivers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use millrace_kernel::{
    AttemptStatus, EngineError, ErrorCode, ErrorDetails, Lease, QueueError, ReservedJob,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ExecutionOrchestrator;
use super::node_runner::RunOutcome;

/// Idle poll cadence when the queue has nothing for us.
const RESERVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

impl ExecutionOrchestrator {
    /// One worker slot's claim-and-run loop.
    pub(crate) async fn worker_loop(&self, slot: usize) {
        let worker_id = format!("worker-{}-{}", std::process::id(), slot);
        let mut shutdown = self.subscribe_shutdown();
        debug!(worker_id, "worker started");

        loop {
            if self.is_shutting_down() {
                break;
            }
            match self.queue.reserve(&worker_id).await {
                Ok(Some(job)) => {
                    self.process_job(job, &worker_id).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(RESERVE_POLL_INTERVAL) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "queue reserve failed");
                    tokio::time::sleep(RESERVE_POLL_INTERVAL).await;
                }
            }
        }
        debug!(worker_id, "worker stopped");
    }

    /// Run one claimed job end to end, including cleanup.
    pub(crate) async fn process_job(&self, job: ReservedJob, worker_id: &str) {
        let organization_id = job.payload.organization_id.clone();
        let connectors = job.payload.connectors.clone();
        let execution_id = job.payload.execution_id;

        // Jobs never cross regions; a mismatch means a routing bug.
        if job.payload.region != self.config.region {
            let err = EngineError::RegionMismatch {
                expected: job.payload.region.to_string(),
                actual: self.config.region.to_string(),
            };
            warn!(execution_id = %execution_id, error = %err, "refusing cross-region job");
            let _ = self
                .run_manager
                .complete_execution(
                    execution_id,
                    None,
                    Some(ErrorDetails::new(err.code(), err.to_string())),
                )
                .await;
            let _ = self.queue.complete(job.job_id, worker_id).await;
            return;
        }

        // 1. Running slot with bounded backoff.
        if !self.acquire_running_slot(&organization_id).await {
            let err = EngineError::ConcurrencyQuotaExceeded {
                organization_id: organization_id.clone(),
                running: self.quotas.running(&organization_id),
                limit: self
                    .tenants
                    .profile(&organization_id)
                    .await
                    .limits
                    .max_concurrent_executions,
            };
            debug!(execution_id = %execution_id, error = %err, "no running slot, returning job");
            let _ = self
                .queue
                .fail(
                    job.job_id,
                    worker_id,
                    &err.to_string(),
                    self.queue_backoff(job.delivery),
                )
                .await;
            return;
        }

        // 2. Connector slots.
        self.connector_slots.register(&organization_id, &connectors);

        let outcome = self.run_claimed(&job, worker_id).await;

        // Always: release slots, whatever happened.
        self.connector_slots.release(&organization_id, &connectors);
        self.quotas.release_running(&organization_id);

        self.apply_disposition(&job, worker_id, outcome).await;
    }

    /// Lease stamp, stale-attempt reconciliation, heartbeat pump, node loop.
    async fn run_claimed(
        &self,
        job: &ReservedJob,
        worker_id: &str,
    ) -> Result<RunOutcome, EngineError> {
        let execution_id = job.payload.execution_id;
        let now = Utc::now();
        let lease = Lease {
            worker_id: worker_id.to_string(),
            locked_at: now,
            lock_expires_at: job.lock_expires_at,
            heartbeat_interval_ms: self.config.heartbeat_interval.as_millis() as u64,
            last_heartbeat_at: now,
            renew_count: 0,
        };

        // 3. queued → running with the lease stamped.
        self.run_manager
            .mark_running(execution_id, lease.clone())
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        // A rescued job may carry attempts a dead worker left `running`.
        self.reconcile_stale_attempts(execution_id).await;

        // 4. Heartbeat pump.
        let abort = Arc::new(AtomicBool::new(false));
        let pump = self.spawn_heartbeat_pump(job.job_id, execution_id, worker_id, lease, &abort);

        // 5. The node loop.
        let result = self.run_execution(job, Arc::clone(&abort)).await;

        pump.abort();
        result
    }

    fn spawn_heartbeat_pump(
        &self,
        job_id: uuid::Uuid,
        execution_id: uuid::Uuid,
        worker_id: &str,
        lease: Lease,
        abort: &Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let run_manager = Arc::clone(&self.run_manager);
        let worker_id = worker_id.to_string();
        let abort = Arc::clone(abort);
        let interval = self.config.heartbeat_interval;
        let persist_every = self.config.heartbeat_persist;
        let lease = Arc::new(Mutex::new(lease));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            let mut last_persist = Instant::now();

            loop {
                ticker.tick().await;
                match queue.renew(job_id, &worker_id).await {
                    Ok(new_expiry) => {
                        let snapshot = {
                            let mut lease = lease.lock();
                            lease.lock_expires_at = new_expiry;
                            lease.last_heartbeat_at = Utc::now();
                            lease.renew_count += 1;
                            lease.clone()
                        };
                        if last_persist.elapsed() >= persist_every {
                            last_persist = Instant::now();
                            if let Err(e) = run_manager.persist_lease(execution_id, snapshot).await
                            {
                                warn!(execution_id = %execution_id, error = %e, "lease persist failed");
                            }
                        }
                    }
                    Err(QueueError::NotLeaseHolder { .. }) | Err(QueueError::NotFound(_)) => {
                        // Another worker owns the job now.
                        warn!(execution_id = %execution_id, "lease lost, aborting pass");
                        abort.store(true, Ordering::Relaxed);
                        return;
                    }
                    Err(e) => {
                        warn!(execution_id = %execution_id, error = %e, "lock renew failed");
                    }
                }
            }
        })
    }

    /// Attempts a dead worker left `running` are failed as lease-lost so
    /// this pass can open fresh ones.
    async fn reconcile_stale_attempts(&self, execution_id: uuid::Uuid) {
        let Ok(attempts) = self
            .run_manager
            .store()
            .attempts_for_execution(execution_id)
            .await
        else {
            return;
        };
        for mut attempt in attempts {
            if attempt.status == AttemptStatus::Running {
                warn!(
                    execution_id = %execution_id,
                    node_id = %attempt.node_id,
                    attempt = attempt.attempt,
                    "failing attempt orphaned by a lost lease"
                );
                attempt.status = AttemptStatus::Failed;
                attempt.ended_at = Some(Utc::now());
                attempt.error = Some(ErrorDetails::new(
                    ErrorCode::LeaseLost,
                    "worker lost its lease mid-attempt",
                ));
                let _ = self.run_manager.store().put_attempt(attempt).await;
            }
        }
    }

    /// §failure-disposition: decide what happens to the job and the
    /// execution row for each error class.
    async fn apply_disposition(
        &self,
        job: &ReservedJob,
        worker_id: &str,
        outcome: Result<RunOutcome, EngineError>,
    ) {
        let execution_id = job.payload.execution_id;
        match outcome {
            Ok(RunOutcome::Completed) | Ok(RunOutcome::Suspended) => {
                if let Err(e) = self.queue.complete(job.job_id, worker_id).await {
                    warn!(execution_id = %execution_id, error = %e, "job complete failed");
                }
            }
            Err(err) => match err.code() {
                // The queue already reclaimed the job; walk away quietly.
                ErrorCode::LeaseLost => {
                    info!(execution_id = %execution_id, "abandoning pass after lease loss");
                }
                // Terminal for the execution, no queue-level retry.
                code if code.is_sandbox_violation()
                    || matches!(
                        code,
                        ErrorCode::QuotaUsage
                            | ErrorCode::ConnectorConcurrency
                            | ErrorCode::RegionMismatch
                            | ErrorCode::Dlq
                    ) =>
                {
                    let _ = self
                        .run_manager
                        .complete_execution(
                            execution_id,
                            None,
                            Some(ErrorDetails::new(code, err.to_string())),
                        )
                        .await;
                    let _ = self.queue.complete(job.job_id, worker_id).await;
                }
                // Everything else: fail the pass, let the queue redeliver
                // with backoff until the delivery budget runs out.
                code => {
                    let redeliveries_remain = job.delivery < self.config.max_retries + 1;
                    if redeliveries_remain {
                        let _ = self
                            .run_manager
                            .mark_queued_for_retry(
                                execution_id,
                                ErrorDetails::new(code, err.to_string()),
                            )
                            .await;
                    } else {
                        let _ = self
                            .run_manager
                            .complete_execution(
                                execution_id,
                                None,
                                Some(ErrorDetails::new(code, err.to_string())),
                            )
                            .await;
                    }
                    let _ = self
                        .queue
                        .fail(
                            job.job_id,
                            worker_id,
                            &err.to_string(),
                            self.queue_backoff(job.delivery),
                        )
                        .await;
                }
            },
        }
    }

    /// Reserve a tenant running slot, polling with bounded backoff.
    async fn acquire_running_slot(&self, organization_id: &str) -> bool {
        let profile = self.tenants.profile(organization_id).await;
        let poll = Duration::from_millis(
            (self.config.lock_renew.as_millis() as u64 / 2).clamp(50, 1_000),
        );
        let deadline = Instant::now() + self.config.lock_duration.max(Duration::from_secs(5));

        loop {
            if self
                .quotas
                .try_reserve_running(organization_id, &profile.limits)
            {
                return true;
            }
            if Instant::now() + poll > deadline || self.is_shutting_down() {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Queue-level redelivery backoff: exponential on the delivery count
    /// with jitter, clamped to the configured ceiling.
    fn queue_backoff(&self, delivery: u32) -> Duration {
        let base = self.config.retry_delay.as_millis() as u64;
        let max = self.config.max_retry_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << delivery.saturating_sub(1).min(16));
        let capped = exp.min(max).max(1);
        let jittered = rand::thread_rng().gen_range((capped * 3 / 4).max(1)..=capped);
        Duration::from_millis(jittered)
    }
}
