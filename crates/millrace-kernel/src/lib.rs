//! Millrace Kernel
//!
//! Shared foundation for the workflow execution engine: the persisted data
//! model, the workflow graph, the error taxonomy, deterministic hashing,
//! environment configuration, and the region-local execution queue.

// config module
pub mod config;

// error module
pub mod error;

// deterministic hashing
pub mod hash;

// execution data model
pub mod execution;

// workflow graph
pub mod workflow;

// queue module
pub mod queue;

pub use config::{EngineConfig, QueueDriver, Region, SandboxEnvConfig, SandboxExecutorKind};
pub use error::{EngineError, EngineResult, ErrorCode, classify_message};
pub use execution::{
    AttemptMetadata, AttemptStatus, DeterministicKeys, ErrorDetails, Execution, ExecutionMetadata,
    ExecutionStatus, Lease, NodeAttempt, QuotaSnapshot, ResumeState, ResumeToken, RetryEvent,
    TenantLimits, TimelineEvent, TimelineEventKind, TimerPayload, TimerStatus, TriggerType,
    UsageRollup, WorkflowTimer,
};
pub use queue::{
    EnqueueOptions, ExecutionQueue, JobPayload, QueueCounts, QueueError, QueueResult, ReservedJob,
    memory::{InMemoryExecutionQueue, MemoryQueueConfig},
};
pub use workflow::{NodeKind, RuntimeCode, WorkflowGraph, WorkflowNode};
