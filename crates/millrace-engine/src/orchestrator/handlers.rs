//! External collaborator seams
//!
//! Node-type implementations, connector dispatch, the parameter-reference
//! resolver, workflow loading and sandbox tenancy config are all external
//! to the engine. The orchestrator talks to them through these traits; the
//! defaults here are the minimal implementations single-process
//! deployments and tests use.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use millrace_kernel::{EngineError, EngineResult, NodeKind, WorkflowGraph, WorkflowNode};
use millrace_sandbox::TenancyConfig;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

/// Context handed to every node handler call.
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub organization_id: String,
    pub user_id: Option<String>,
    pub node_id: String,
    pub attempt: u32,
    pub timeout: Duration,
    pub idempotency_key: String,
    /// Composed abort: worker shutdown, per-node timeout, lease loss.
    pub abort: Arc<AtomicBool>,
}

/// Signal that a node wants to suspend until an external callback.
#[derive(Debug, Clone)]
pub struct WaitSignal {
    pub wait_until: DateTime<Utc>,
}

/// What a node handler returns.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub value: Value,
    pub cost: Option<f64>,
    pub tokens: Option<u64>,
    /// Set when the node suspends pending an external callback.
    pub wait: Option<WaitSignal>,
}

impl NodeOutput {
    pub fn value(value: Value) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn waiting(wait_until: DateTime<Utc>) -> Self {
        Self {
            wait: Some(WaitSignal { wait_until }),
            ..Default::default()
        }
    }
}

/// Built-in node types (LLM, HTTP, transform, unknown fallback).
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(
        &self,
        kind: &NodeKind,
        node: &WorkflowNode,
        input: &Value,
        ctx: &NodeContext,
    ) -> EngineResult<NodeOutput>;
}

/// Default handler: no node types wired.
pub struct NullNodeHandler;

#[async_trait]
impl NodeHandler for NullNodeHandler {
    async fn execute(
        &self,
        kind: &NodeKind,
        node: &WorkflowNode,
        _input: &Value,
        _ctx: &NodeContext,
    ) -> EngineResult<NodeOutput> {
        Err(EngineError::Internal(format!(
            "no handler registered for node '{}' ({:?})",
            node.id, kind
        )))
    }
}

/// Third-party connector dispatch.
#[async_trait]
pub trait ConnectorDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        app: &str,
        operation: &str,
        params: &Value,
        ctx: &NodeContext,
    ) -> EngineResult<NodeOutput>;

    /// Generic fallback path, fed parameters enriched with the
    /// idempotency key. Only reached when `GENERIC_EXECUTOR_ENABLED`.
    async fn dispatch_generic(
        &self,
        app: &str,
        operation: &str,
        params: &Value,
        ctx: &NodeContext,
    ) -> EngineResult<NodeOutput> {
        let _ = (app, operation, params, ctx);
        Err(EngineError::Internal("generic executor not implemented".into()))
    }
}

/// Default dispatcher: no connectors wired.
pub struct NullConnectorDispatcher;

#[async_trait]
impl ConnectorDispatcher for NullConnectorDispatcher {
    async fn dispatch(
        &self,
        app: &str,
        _operation: &str,
        _params: &Value,
        _ctx: &NodeContext,
    ) -> EngineResult<NodeOutput> {
        Err(EngineError::Internal(format!(
            "no connector dispatcher registered for '{}'",
            app
        )))
    }
}

/// Resolves parameter references against prior node outputs.
#[async_trait]
pub trait ParameterResolver: Send + Sync {
    async fn resolve(
        &self,
        params: &Value,
        node_outputs: &HashMap<String, Value>,
        prev_output: Option<&Value>,
    ) -> EngineResult<Value>;
}

/// Pass-through resolver: parameters are used verbatim.
pub struct IdentityResolver;

#[async_trait]
impl ParameterResolver for IdentityResolver {
    async fn resolve(
        &self,
        params: &Value,
        _node_outputs: &HashMap<String, Value>,
        _prev_output: Option<&Value>,
    ) -> EngineResult<Value> {
        Ok(params.clone())
    }
}

/// Workflow loading seam.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn load(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowGraph>>;
}

/// In-memory registry of workflow graphs.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, Arc<WorkflowGraph>>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, graph: WorkflowGraph) {
        self.workflows
            .write()
            .insert(graph.id.clone(), Arc::new(graph));
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn load(&self, workflow_id: &str) -> EngineResult<Arc<WorkflowGraph>> {
        self.workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidWorkflow(format!("workflow '{}' not found", workflow_id)))
    }
}

/// Sandbox tenancy config per organization.
#[async_trait]
pub trait TenancyConfigSource: Send + Sync {
    async fn tenancy(&self, organization_id: &str) -> TenancyConfig;
}

/// One config for everyone.
#[derive(Default)]
pub struct StaticTenancyConfig {
    config: TenancyConfig,
}

impl StaticTenancyConfig {
    pub fn new(config: TenancyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TenancyConfigSource for StaticTenancyConfig {
    async fn tenancy(&self, _organization_id: &str) -> TenancyConfig {
        self.config.clone()
    }
}

/// Marker placed at `Utc::now()` when a node suspends with no explicit
/// deadline; callback tokens expire after this long by default.
pub const DEFAULT_CALLBACK_TTL: Duration = Duration::from_secs(24 * 3_600);
