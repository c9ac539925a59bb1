//! Execution orchestrator
//!
//! The scheduler kernel: admission against tenant quotas, tenant-fair
//! dispatch off the region queue, lease + heartbeat management, the node
//! execution loop, suspension on timers and callbacks, and deterministic
//! resume. Collaborators are injected; nothing here reaches for module
//! state.

pub mod admission;
pub mod handlers;
pub mod node_runner;
pub mod timers;
pub mod worker;

use std::sync::Arc;

use millrace_kernel::{
    EngineConfig, EngineError, EngineResult, ExecutionQueue, InMemoryExecutionQueue,
    MemoryQueueConfig, QueueCounts, QueueDriver, ResumeState, TriggerType,
};
use millrace_sandbox::{NetworkAuditSink, NullAuditSink, SandboxSupervisor};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::quota::{
    ConnectorSlots, StaticTenantDirectory, TenantDirectory, TenantQuotas, UnlimitedUsageQuota,
    UsageQuotaService,
};
use crate::retry::RetryManager;
use crate::run_store::{ExecutionStore, MemoryExecutionStore, RunExecutionManager};

pub use handlers::{
    ConnectorDispatcher, IdentityResolver, InMemoryWorkflowRepository, NodeContext, NodeHandler,
    NodeOutput, NullConnectorDispatcher, NullNodeHandler, ParameterResolver, StaticTenancyConfig,
    TenancyConfigSource, WaitSignal, WorkflowRepository,
};

/// New-run request.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub workflow_id: String,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    /// Replay: reference to the source execution.
    pub replay_of: Option<Uuid>,
}

/// Resume request, from the timer sweeper or a consumed callback token.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub execution_id: Uuid,
    pub resume_state: ResumeState,
    pub initial_data: Option<Value>,
    pub timer_id: Option<Uuid>,
    pub token_id: Option<Uuid>,
}

/// The orchestrator. Construct via [`ExecutionOrchestrator::builder`].
pub struct ExecutionOrchestrator {
    pub(crate) config: EngineConfig,
    pub(crate) queue: Arc<dyn ExecutionQueue>,
    pub(crate) run_manager: Arc<RunExecutionManager>,
    pub(crate) retry: Arc<RetryManager>,
    pub(crate) sandbox: Arc<SandboxSupervisor>,
    pub(crate) handlers: Arc<dyn NodeHandler>,
    pub(crate) connectors: Arc<dyn ConnectorDispatcher>,
    pub(crate) resolver: Arc<dyn ParameterResolver>,
    pub(crate) workflows: Arc<dyn WorkflowRepository>,
    pub(crate) usage_quota: Arc<dyn UsageQuotaService>,
    pub(crate) tenants: Arc<dyn TenantDirectory>,
    pub(crate) tenancy: Arc<dyn TenancyConfigSource>,
    pub(crate) quotas: TenantQuotas,
    pub(crate) connector_slots: ConnectorSlots,
    pub(crate) shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder over the injectable collaborators.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    queue: Option<Arc<dyn ExecutionQueue>>,
    store: Option<Arc<dyn ExecutionStore>>,
    sandbox: Option<Arc<SandboxSupervisor>>,
    handlers: Option<Arc<dyn NodeHandler>>,
    connectors: Option<Arc<dyn ConnectorDispatcher>>,
    resolver: Option<Arc<dyn ParameterResolver>>,
    workflows: Option<Arc<dyn WorkflowRepository>>,
    usage_quota: Option<Arc<dyn UsageQuotaService>>,
    tenants: Option<Arc<dyn TenantDirectory>>,
    tenancy: Option<Arc<dyn TenancyConfigSource>>,
    retry: Option<Arc<RetryManager>>,
}

impl OrchestratorBuilder {
    pub fn queue(mut self, queue: Arc<dyn ExecutionQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<SandboxSupervisor>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn handlers(mut self, handlers: Arc<dyn NodeHandler>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn connectors(mut self, connectors: Arc<dyn ConnectorDispatcher>) -> Self {
        self.connectors = Some(connectors);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ParameterResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn workflows(mut self, workflows: Arc<dyn WorkflowRepository>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    pub fn usage_quota(mut self, usage_quota: Arc<dyn UsageQuotaService>) -> Self {
        self.usage_quota = Some(usage_quota);
        self
    }

    pub fn tenants(mut self, tenants: Arc<dyn TenantDirectory>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    pub fn tenancy(mut self, tenancy: Arc<dyn TenancyConfigSource>) -> Self {
        self.tenancy = Some(tenancy);
        self
    }

    pub fn retry(mut self, retry: Arc<RetryManager>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> EngineResult<Arc<ExecutionOrchestrator>> {
        let config = self.config;
        let queue = match self.queue {
            Some(queue) => queue,
            None => match config.queue_driver {
                QueueDriver::InMemory => Arc::new(InMemoryExecutionQueue::new(MemoryQueueConfig {
                    lease_duration: config.lock_duration,
                    tenant_concurrency: config.tenant_concurrency,
                    max_deliveries: config.max_retries + 1,
                })),
                QueueDriver::Durable => {
                    return Err(EngineError::Queue(
                        "QUEUE_DRIVER=durable requires an injected queue".into(),
                    ));
                }
            },
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryExecutionStore::new()));
        let run_manager = Arc::new(RunExecutionManager::new(store));
        let retry = self.retry.unwrap_or_else(|| {
            Arc::new(RetryManager::new(Arc::new(
                crate::idempotency::IdempotencyStore::in_memory(),
            )))
        });
        let sandbox = self.sandbox.unwrap_or_else(|| {
            let audit: Arc<dyn NetworkAuditSink> = Arc::new(NullAuditSink);
            Arc::new(SandboxSupervisor::from_env(config.sandbox.clone(), audit))
        });

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(ExecutionOrchestrator {
            config,
            queue,
            run_manager,
            retry,
            sandbox,
            handlers: self.handlers.unwrap_or_else(|| Arc::new(NullNodeHandler)),
            connectors: self
                .connectors
                .unwrap_or_else(|| Arc::new(NullConnectorDispatcher)),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(IdentityResolver)),
            workflows: self
                .workflows
                .unwrap_or_else(|| Arc::new(InMemoryWorkflowRepository::new())),
            usage_quota: self
                .usage_quota
                .unwrap_or_else(|| Arc::new(UnlimitedUsageQuota)),
            tenants: self
                .tenants
                .unwrap_or_else(|| Arc::new(StaticTenantDirectory::default())),
            tenancy: self
                .tenancy
                .unwrap_or_else(|| Arc::new(StaticTenancyConfig::default())),
            quotas: TenantQuotas::new(),
            connector_slots: ConnectorSlots::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

impl ExecutionOrchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            queue: None,
            store: None,
            sandbox: None,
            handlers: None,
            connectors: None,
            resolver: None,
            workflows: None,
            usage_quota: None,
            tenants: None,
            tenancy: None,
            retry: None,
        }
    }

    pub fn run_manager(&self) -> &Arc<RunExecutionManager> {
        &self.run_manager
    }

    pub fn retry_manager(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the workers, the timer sweeper and the periodic cleanups.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        info!(
            workers = self.config.worker_concurrency,
            tenant_cap = self.config.tenant_concurrency,
            region = %self.config.region,
            "starting execution orchestrator"
        );
        for slot in 0..self.config.worker_concurrency {
            let orchestrator = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                orchestrator.worker_loop(slot).await;
            }));
        }
        let orchestrator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            orchestrator.timer_sweeper_loop().await;
        }));
        self.retry.start_cleanup();
        self.run_manager.start_retention_sweeper();
    }

    /// Stop everything; in-flight jobs observe the shutdown signal.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.retry.stop_cleanup();
        self.run_manager.stop_retention_sweeper();
        info!("execution orchestrator stopped");
    }

    /// Consume a callback token and enqueue the resume it unlocks.
    ///
    /// Backs `POST /executions/{executionId}/callbacks/{tokenId}`.
    pub async fn consume_callback(
        &self,
        execution_id: Uuid,
        token_id: Uuid,
        initial_data: Option<Value>,
    ) -> EngineResult<()> {
        let token = self
            .run_manager
            .store()
            .consume_token(token_id, chrono::Utc::now())
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        if token.execution_id != execution_id {
            return Err(EngineError::Store(format!(
                "token {} does not belong to execution {}",
                token_id, execution_id
            )));
        }

        let execution = self
            .run_manager
            .get(execution_id)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| EngineError::Store(format!("execution {} not found", execution_id)))?;
        let resume_state = execution.metadata.resume_state.clone().ok_or_else(|| {
            EngineError::Store(format!("execution {} has no resume state", execution_id))
        })?;

        self.enqueue_resume(ResumeRequest {
            execution_id,
            resume_state,
            initial_data,
            timer_id: None,
            token_id: Some(token_id),
        })
        .await
    }

    /// Queue depth counters for the region queue.
    pub async fn queue_counts(&self) -> QueueCounts {
        self.queue.counts().await
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl Drop for ExecutionOrchestrator {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let _ = self.shutdown.send(true);
    }
}
