//! Millrace Engine
//!
//! The orchestration kernel of the workflow execution engine: admission
//! against per-tenant quotas, a tenant-fair worker pool with leases and
//! heartbeats, policy-driven retries with circuit breakers and an
//! idempotent result cache, durable run-state recording, and deterministic
//! suspend/resume over timers and callbacks.

// idempotency store (C1)
pub mod idempotency;

// retry manager + circuit breakers (C2)
pub mod retry;

// run-state store (C4)
pub mod run_store;

// tenant quotas and external quota seams
pub mod quota;

// execution orchestrator (C5)
pub mod orchestrator;

pub use idempotency::{
    IdempotencyBackend, IdempotencyRecord, IdempotencyStore, MemoryIdempotencyBackend, StoreError,
    StoreResult,
};
pub use orchestrator::{
    ConnectorDispatcher, EnqueueRequest, ExecutionOrchestrator, IdentityResolver,
    InMemoryWorkflowRepository, NodeContext, NodeHandler, NodeOutput, NullConnectorDispatcher,
    NullNodeHandler, OrchestratorBuilder, ParameterResolver, ResumeRequest, StaticTenancyConfig,
    TenancyConfigSource, WaitSignal, WorkflowRepository,
};
pub use quota::{
    ConnectorSlots, StaticTenantDirectory, TenantDirectory, TenantProfile, TenantQuotas,
    UnlimitedUsageQuota, UsageQuotaService, UsageVerdict,
};
pub use retry::{
    ActionableError, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
    ErrorFilter, RetryManager, RetryOptions, RetryPolicy, RetryStats, Severity,
};
pub use run_store::{
    ExecutionQuery, ExecutionSort, ExecutionStats, ExecutionStore, MemoryExecutionStore,
    RunExecutionManager, RunStoreError, RunStoreResult, StartNodeOptions, StatsBucket,
};
