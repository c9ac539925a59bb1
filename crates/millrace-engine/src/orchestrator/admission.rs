//! Admission
//!
//! Every new run passes the full gauntlet before a job exists: usage
//! quota, connector concurrency, then the rate window. Denials create a
//! terminal `failed` execution row carrying the verdict so the caller can
//! observe exactly why nothing ran.

use chrono::Utc;
use millrace_kernel::{
    EngineError, EngineResult, EnqueueOptions, ErrorDetails, Execution, ExecutionStatus,
    JobPayload,
};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::{EnqueueRequest, ExecutionOrchestrator, ResumeRequest};
use crate::retry::Severity;

impl ExecutionOrchestrator {
    /// Admit one run: quota checks, a queued execution row, one job on the
    /// region queue. Returns the execution id.
    pub async fn enqueue(&self, request: EnqueueRequest) -> EngineResult<Uuid> {
        // 1. Load the workflow and extract its connector set.
        let graph = self.workflows.load(&request.workflow_id).await?;
        graph
            .validate()
            .map_err(|errors| EngineError::InvalidWorkflow(errors.join("; ")))?;
        let connectors = graph.connector_ids();

        // 2. Tenant profile.
        let profile = self.tenants.profile(&request.organization_id).await;

        // 3. Usage quota, when the user is known.
        if let Some(user_id) = &request.user_id {
            let verdict = self
                .usage_quota
                .check(&request.organization_id, user_id)
                .await;
            if !verdict.allowed {
                let reason = verdict.reason.clone().unwrap_or_else(|| "plan limit".into());
                let err = EngineError::UsageQuotaExceeded {
                    organization_id: request.organization_id.clone(),
                    reason: reason.clone(),
                };
                let execution_id = self.record_admission_failure(&request, &err).await;
                self.retry.push_error(
                    execution_id,
                    "",
                    err.code(),
                    Severity::Warning,
                    format!("quota_block: {}", reason),
                    Value::Null,
                );
                return Err(err);
            }
        }

        // 4. Connector concurrency.
        if let Err(err) =
            self.connector_slots
                .check_available(&request.organization_id, &connectors, &profile)
        {
            self.record_admission_failure(&request, &err).await;
            return Err(err);
        }

        // 5. Rate window + running-slot admission, atomically.
        let quota_snapshot = match self.quotas.admit(&request.organization_id, &profile.limits) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let execution_id = self.record_admission_failure(&request, &err).await;
                self.retry.push_error(
                    execution_id,
                    "",
                    err.code(),
                    Severity::Warning,
                    err.to_string(),
                    Value::Null,
                );
                return Err(err);
            }
        };

        // 6. Queued execution row with its admission snapshot.
        let mut execution = Execution::new(
            request.workflow_id.clone(),
            request.organization_id.clone(),
            request.user_id.clone(),
            request.trigger_type,
            request.trigger_data.clone(),
        );
        execution.metadata.region = Some(self.config.region);
        execution.metadata.quota = Some(quota_snapshot);
        execution.metadata.replayed_from = request.replay_of;
        let execution_id = execution.id;

        if let Err(e) = self.run_manager.create_execution(execution).await {
            self.quotas.release_admission(&request.organization_id);
            return Err(EngineError::Store(e.to_string()));
        }

        // 7. One job on the region queue, tenant-grouped.
        let payload = JobPayload {
            execution_id,
            workflow_id: request.workflow_id.clone(),
            organization_id: request.organization_id.clone(),
            user_id: request.user_id.clone(),
            trigger_type: request.trigger_type,
            trigger_data: Some(request.trigger_data.clone()),
            resume_state: None,
            initial_data: None,
            timer_id: None,
            resume_token_id: None,
            connectors,
            region: self.config.region,
        };
        let enqueue = self
            .queue
            .add(
                payload,
                EnqueueOptions {
                    job_id: execution_id,
                    group: request.organization_id.clone(),
                },
            )
            .await;

        if let Err(e) = enqueue {
            // Roll back the admission and surface the failure on the row.
            self.quotas.release_admission(&request.organization_id);
            warn!(execution_id = %execution_id, error = %e, "enqueue failed after admission");
            let err = EngineError::Queue(e.to_string());
            let _ = self
                .run_manager
                .complete_execution(
                    execution_id,
                    None,
                    Some(ErrorDetails::new(err.code(), err.to_string())),
                )
                .await;
            return Err(err);
        }

        info!(
            execution_id = %execution_id,
            workflow_id = %request.workflow_id,
            organization_id = %request.organization_id,
            "execution admitted"
        );
        Ok(execution_id)
    }

    /// Replay a terminal execution: a brand-new run of the same workflow
    /// and trigger data, referencing its source. The source row is never
    /// touched; terminal statuses do not transition back.
    pub async fn replay(&self, source_id: Uuid) -> EngineResult<Uuid> {
        let source = self
            .run_manager
            .get(source_id)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| EngineError::Store(format!("execution {} not found", source_id)))?;
        if !source.status.is_terminal() {
            return Err(EngineError::Store(format!(
                "execution {} is still {}, only terminal executions can be replayed",
                source_id, source.status
            )));
        }
        self.enqueue(EnqueueRequest {
            workflow_id: source.workflow_id,
            organization_id: source.organization_id,
            user_id: source.user_id,
            trigger_type: millrace_kernel::TriggerType::Replay,
            trigger_data: source.trigger_data,
            replay_of: Some(source_id),
        })
        .await
    }

    /// Enqueue a resume job for a suspended execution. Shares the tenant
    /// group and region queue with fresh runs; admission quotas are not
    /// re-checked, since the execution was admitted once already.
    pub async fn enqueue_resume(&self, request: ResumeRequest) -> EngineResult<()> {
        let execution = self
            .run_manager
            .get(request.execution_id)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| {
                EngineError::Store(format!("execution {} not found", request.execution_id))
            })?;

        if execution.status.is_terminal() {
            return Err(EngineError::Store(format!(
                "execution {} is already {}",
                execution.id, execution.status
            )));
        }

        let graph = self.workflows.load(&execution.workflow_id).await?;
        // Resume jobs get their own id so they dedupe per suspension, not
        // per execution.
        let job_id = request
            .timer_id
            .or(request.token_id)
            .unwrap_or_else(Uuid::new_v4);

        self.queue
            .add(
                JobPayload {
                    execution_id: execution.id,
                    workflow_id: execution.workflow_id.clone(),
                    organization_id: execution.organization_id.clone(),
                    user_id: execution.user_id.clone(),
                    trigger_type: execution.trigger_type,
                    trigger_data: Some(execution.trigger_data.clone()),
                    resume_state: Some(request.resume_state),
                    initial_data: request.initial_data,
                    timer_id: request.timer_id,
                    resume_token_id: request.token_id,
                    connectors: graph.connector_ids(),
                    region: self.config.region,
                },
                EnqueueOptions {
                    job_id,
                    group: execution.organization_id.clone(),
                },
            )
            .await
            .map_err(|e| EngineError::Queue(e.to_string()))?;

        info!(
            execution_id = %execution.id,
            timer_id = ?request.timer_id,
            token_id = ?request.token_id,
            "resume enqueued"
        );
        Ok(())
    }

    /// Create the terminal failed row an admission denial leaves behind.
    async fn record_admission_failure(&self, request: &EnqueueRequest, err: &EngineError) -> Uuid {
        let mut execution = Execution::new(
            request.workflow_id.clone(),
            request.organization_id.clone(),
            request.user_id.clone(),
            request.trigger_type,
            request.trigger_data.clone(),
        );
        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(Utc::now());
        execution.duration_ms = Some(0);
        execution.error = Some(ErrorDetails::new(err.code(), err.to_string()));
        execution.metadata.region = Some(self.config.region);
        let id = execution.id;
        if let Err(e) = self.run_manager.create_execution(execution).await {
            warn!(error = %e, "failed to persist admission denial");
        }
        id
    }
}
