//! Node execution loop
//!
//! Walks the graph in topological order, wraps every node call in the
//! retry manager, dispatches by node kind, and handles the three
//! suspension vectors. Deterministic keys are always read from resume
//! state before anything is generated, so resumed executions reproduce
//! their keys byte-for-byte.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use millrace_kernel::{
    AttemptMetadata, EngineError, EngineResult, ErrorDetails, NodeKind, ReservedJob, ResumeState,
    TimerPayload, TimerStatus, WorkflowGraph, WorkflowNode, WorkflowTimer, hash,
};
use millrace_sandbox::{AuditContext, PolicyOverrides, SandboxRequest, ScopeKey};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handlers::{NodeContext, NodeOutput, DEFAULT_CALLBACK_TTL};
use super::ExecutionOrchestrator;
use crate::retry::{CircuitBreakerConfig, RetryOptions, RetryPolicy};
use crate::run_store::StartNodeOptions;

/// Default per-node timeout when neither the node nor the runtime says
/// otherwise.
const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delays at or under this are slept inline instead of writing a timer.
const INLINE_DELAY_CAP: Duration = Duration::from_millis(50);

/// How one pass over an execution ended.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    Completed,
    Suspended,
}

/// Mutable state threaded through one pass.
struct RunState {
    node_outputs: HashMap<String, Value>,
    prev_output: Option<Value>,
    idempotency_keys: HashMap<String, String>,
    request_hashes: HashMap<String, String>,
    started_at: chrono::DateTime<Utc>,
}

impl ExecutionOrchestrator {
    /// Execute (or resume) one claimed job to completion or suspension.
    pub(crate) async fn run_execution(
        &self,
        job: &ReservedJob,
        abort: Arc<AtomicBool>,
    ) -> EngineResult<RunOutcome> {
        let payload = &job.payload;
        let graph = self.workflows.load(&payload.workflow_id).await?;
        let order = graph
            .topological_sort()
            .map_err(EngineError::InvalidWorkflow)?;

        let execution = self
            .run_manager
            .get(payload.execution_id)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| {
                EngineError::Store(format!("execution {} not found", payload.execution_id))
            })?;

        // Rebuild working state: resume snapshot first, then whatever the
        // execution row itself remembers.
        let mut state = match &payload.resume_state {
            Some(resume) => RunState {
                node_outputs: resume.node_outputs.clone(),
                prev_output: resume.prev_output.clone(),
                idempotency_keys: resume.idempotency_keys.clone(),
                request_hashes: resume.request_hashes.clone(),
                started_at: resume.started_at,
            },
            None => RunState {
                node_outputs: execution.node_outputs.clone(),
                prev_output: None,
                idempotency_keys: execution.metadata.deterministic_keys.idempotency.clone(),
                request_hashes: execution.metadata.deterministic_keys.request_hashes.clone(),
                started_at: execution.started_at,
            },
        };

        // A callback resume carries the waiting node's output.
        if payload.resume_token_id.is_some()
            && let Some(data) = &payload.initial_data
        {
            if let Some(waiting_node) =
                waiting_node_id(&order, payload.resume_state.as_ref())
            {
                state
                    .node_outputs
                    .insert(waiting_node.clone(), data.clone());
            }
            state.prev_output = Some(data.clone());
        }

        let start_index = start_index(&order, payload.resume_state.as_ref());
        let seed = deterministic_seed(&execution.trigger_data, execution.id);

        for position in start_index..order.len() {
            let node_id = &order[position];
            if state.node_outputs.contains_key(node_id) {
                debug!(execution_id = %execution.id, node_id, "skipping completed node");
                continue;
            }
            if abort.load(Ordering::Relaxed) {
                return Err(EngineError::LeaseLost {
                    execution_id: execution.id.to_string(),
                });
            }

            let node = graph
                .get_node(node_id)
                .ok_or_else(|| EngineError::InvalidWorkflow(format!("node '{}' missing", node_id)))?;

            match self
                .run_node(&execution, &graph, &order, position, node, &mut state, &seed, &abort)
                .await?
            {
                NodeStep::Continue => {}
                NodeStep::Suspend => return Ok(RunOutcome::Suspended),
            }
        }

        // Terminal success: persist outputs and the deterministic key map.
        let final_output = state.prev_output.clone();
        let keys = state.idempotency_keys.clone();
        let hashes = state.request_hashes.clone();
        let outputs = state.node_outputs.clone();
        self.run_manager
            .update_metadata(execution.id, move |e| {
                e.node_outputs.extend(outputs);
                e.metadata.deterministic_keys.idempotency.extend(keys);
                e.metadata.deterministic_keys.request_hashes.extend(hashes);
            })
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        self.run_manager
            .complete_execution(execution.id, final_output, None)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(RunOutcome::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_node(
        &self,
        execution: &millrace_kernel::Execution,
        graph: &WorkflowGraph,
        order: &[String],
        position: usize,
        node: &WorkflowNode,
        state: &mut RunState,
        seed: &Value,
        abort: &Arc<AtomicBool>,
    ) -> EngineResult<NodeStep> {
        let node_id = node.id.clone();
        let connector_id = node.effective_connector_id();
        let timeout = node
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_NODE_TIMEOUT);

        // Deterministic key: resume state first, generator second.
        let idempotency_key = state
            .idempotency_keys
            .entry(node_id.clone())
            .or_insert_with(|| hash::idempotency_key(&execution.workflow_id, &node_id, Some(seed)))
            .clone();

        let attempt_number = self.retry.attempt_count(execution.id, &node_id) + 1;

        // Resolve parameters against prior outputs.
        let params = self
            .resolver
            .resolve(&node.params, &state.node_outputs, state.prev_output.as_ref())
            .await?;

        let request_hash = state
            .request_hashes
            .entry(node_id.clone())
            .or_insert_with(|| hash::request_hash(&params))
            .clone();
        self.retry
            .register_request_hash(execution.id, &node_id, request_hash.clone());

        self.run_manager
            .start_node(
                execution.id,
                node,
                params.clone(),
                attempt_number,
                StartNodeOptions {
                    timeout_ms: Some(timeout.as_millis() as u64),
                    connector_id: connector_id.clone(),
                    idempotency_key: Some(idempotency_key.clone()),
                    request_hash: Some(request_hash.clone()),
                },
            )
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        // Delay nodes are the scheduler's own business.
        if node.kind == NodeKind::Delay {
            return self
                .run_delay_node(execution, graph, order, position, node, state)
                .await;
        }

        let ctx = NodeContext {
            execution_id: execution.id,
            workflow_id: execution.workflow_id.clone(),
            organization_id: execution.organization_id.clone(),
            user_id: execution.user_id.clone(),
            node_id: node_id.clone(),
            attempt: attempt_number,
            timeout,
            idempotency_key: idempotency_key.clone(),
            abort: Arc::clone(abort),
        };

        // Side channel for usage metadata and wait signals: the retry
        // manager only sees the JSON value.
        let side_channel: Arc<Mutex<Option<NodeOutput>>> = Arc::new(Mutex::new(None));
        let options = RetryOptions {
            policy: Some(RetryPolicy {
                max_attempts: self.config.max_retries.max(1),
                initial_delay_ms: self.config.retry_delay.as_millis() as u64,
                max_delay_ms: self.config.max_retry_delay.as_millis() as u64,
                ..Default::default()
            }),
            idempotency_key: Some(idempotency_key.clone()),
            node_type: Some(format!("{:?}", node.kind)),
            connector_id: connector_id.clone(),
            node_label: Some(node.label.clone()),
            circuit: Some(CircuitBreakerConfig::default()),
        };

        let outcome = self
            .retry
            .execute_with_retry(
                &node_id,
                execution.id,
                |_attempt| {
                    let side_channel = Arc::clone(&side_channel);
                    let ctx = ctx.clone();
                    let params = params.clone();
                    let node = node.clone();
                    async move {
                        let output = self.dispatch_node(&node, &params, &ctx).await?;
                        let value = output.value.clone();
                        *side_channel.lock() = Some(output);
                        Ok(value)
                    }
                },
                options,
            )
            .await;

        match outcome {
            Ok(value) => {
                let side = side_channel.lock().take();
                let cache_hit = side.is_none();

                // Callback suspension requested by the node.
                if let Some(output) = &side
                    && let Some(wait) = &output.wait
                {
                    return self
                        .suspend_for_callback(execution, order, position, node, state, wait.wait_until)
                        .await;
                }

                let metadata = AttemptMetadata {
                    idempotency_key: Some(idempotency_key),
                    request_hash: Some(request_hash),
                    result_hash: Some(hash::result_hash(Some(&value))),
                    connector_id: connector_id.clone(),
                    circuit_state: connector_id.as_deref().and_then(|c| {
                        self.retry
                            .breakers()
                            .snapshot(c, &node_id)
                            .map(|s| s.state.to_string())
                    }),
                    cost: side.as_ref().and_then(|o| o.cost),
                    tokens: side.as_ref().and_then(|o| o.tokens),
                    cache_hit,
                    timeout_ms: Some(timeout.as_millis() as u64),
                };
                self.run_manager
                    .complete_node(execution.id, &node_id, value.clone(), metadata)
                    .await
                    .map_err(|e| EngineError::Store(e.to_string()))?;

                state.node_outputs.insert(node_id, value.clone());
                state.prev_output = Some(value);
                Ok(NodeStep::Continue)
            }
            Err(err) => {
                let details = ErrorDetails::new(err.code(), err.to_string()).for_node(&node_id);
                self.run_manager
                    .fail_node(execution.id, &node_id, details, AttemptMetadata::default())
                    .await
                    .map_err(|e| EngineError::Store(e.to_string()))?;
                Err(EngineError::NodeFailed {
                    label: node.label.clone(),
                    code: err.code(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Dispatch one node attempt by kind.
    async fn dispatch_node(
        &self,
        node: &WorkflowNode,
        params: &Value,
        ctx: &NodeContext,
    ) -> EngineResult<NodeOutput> {
        if node.is_sandboxed() {
            return self.run_sandboxed_node(node, params, ctx).await;
        }
        match &node.kind {
            NodeKind::Connector { app, operation } => {
                self.run_connector_node(app, operation, params, ctx).await
            }
            // Built-ins and the explicit unknown fallback go to the
            // external handler.
            kind => {
                let handler = self.handlers.execute(kind, node, params, ctx);
                match tokio::time::timeout(ctx.timeout, handler).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout {
                        duration_ms: ctx.timeout.as_millis() as u64,
                    }),
                }
            }
        }
    }

    async fn run_sandboxed_node(
        &self,
        node: &WorkflowNode,
        params: &Value,
        ctx: &NodeContext,
    ) -> EngineResult<NodeOutput> {
        let runtime = node.runtime.as_ref().ok_or_else(|| {
            EngineError::InvalidWorkflow(format!("sandboxed node '{}' has no code", node.id))
        })?;
        let tenancy = self.tenancy.tenancy(&ctx.organization_id).await;

        let request = SandboxRequest {
            scope: ScopeKey::for_organization("node-sandbox", &ctx.organization_id)
                .with_execution(ctx.execution_id)
                .with_node(&ctx.node_id),
            code: runtime.code.clone(),
            entry_point: runtime.entry_point.clone(),
            params: params.clone(),
            context: json!({
                "execution_id": ctx.execution_id,
                "workflow_id": ctx.workflow_id,
                "node_id": ctx.node_id,
                "attempt": ctx.attempt,
                "idempotency_key": ctx.idempotency_key,
            }),
            secrets: Vec::new(),
            timeout: ctx.timeout,
            tenancy,
            overrides: PolicyOverrides::default(),
            audit_context: AuditContext {
                organization_id: ctx.organization_id.clone(),
                execution_id: Some(ctx.execution_id),
                node_id: Some(ctx.node_id.clone()),
                connection_id: None,
                user_id: ctx.user_id.clone(),
            },
            abort: Arc::clone(&ctx.abort),
        };

        let outcome = self.sandbox.execute(request).await.map_err(EngineError::from)?;
        debug!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            duration_ms = outcome.duration_ms,
            logs = outcome.logs.len(),
            "sandboxed node finished"
        );
        Ok(NodeOutput::value(outcome.result))
    }

    async fn run_connector_node(
        &self,
        app: &str,
        operation: &str,
        params: &Value,
        ctx: &NodeContext,
    ) -> EngineResult<NodeOutput> {
        match self.connectors.dispatch(app, operation, params, ctx).await {
            Ok(output) => Ok(output),
            Err(primary_err) if self.config.generic_executor_enabled => {
                // Generic fallback: clone parameters, enrich with the
                // idempotency key under both spellings.
                let mut enriched = params.clone();
                if let Value::Object(map) = &mut enriched {
                    map.insert("idempotency_key".into(), json!(ctx.idempotency_key));
                    map.insert("idempotencyKey".into(), json!(ctx.idempotency_key));
                }
                warn!(
                    execution_id = %ctx.execution_id,
                    node_id = %ctx.node_id,
                    app,
                    error = %primary_err,
                    "connector dispatch failed, trying generic executor"
                );
                let fallback = self
                    .connectors
                    .dispatch_generic(app, operation, &enriched, ctx)
                    .await?;
                let reason = primary_err.to_string();
                let node_id = ctx.node_id.clone();
                let _ = self
                    .run_manager
                    .update_metadata(ctx.execution_id, move |e| {
                        e.metadata.fallback_reasons.insert(node_id, reason);
                    })
                    .await;
                Ok(fallback)
            }
            Err(err) => Err(err),
        }
    }

    /// Delay node: short delays sleep inline; longer ones write a durable
    /// timer and suspend.
    async fn run_delay_node(
        &self,
        execution: &millrace_kernel::Execution,
        graph: &WorkflowGraph,
        order: &[String],
        position: usize,
        node: &WorkflowNode,
        state: &mut RunState,
    ) -> EngineResult<NodeStep> {
        let delay = Duration::from_millis(node.delay_ms());
        let more_nodes_remain = position + 1 < order.len();
        let output = json!({"delayMs": delay.as_millis() as u64});

        // The delay node's own attempt completes either way; the timer
        // only covers the rest of the graph.
        if !delay.is_zero() && delay <= INLINE_DELAY_CAP {
            tokio::time::sleep(delay).await;
        }
        self.run_manager
            .complete_node(
                execution.id,
                &node.id,
                output.clone(),
                AttemptMetadata {
                    idempotency_key: state.idempotency_keys.get(&node.id).cloned(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        state.node_outputs.insert(node.id.clone(), output.clone());
        state.prev_output = Some(output);

        if delay <= INLINE_DELAY_CAP || !more_nodes_remain {
            return Ok(NodeStep::Continue);
        }

        let resume_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let resume_state = build_resume_state(order, position + 1, state);
        let timer = WorkflowTimer {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            resume_at,
            payload: TimerPayload {
                workflow_id: execution.workflow_id.clone(),
                organization_id: execution.organization_id.clone(),
                user_id: execution.user_id.clone(),
                resume_state: resume_state.clone(),
                connectors: graph.connector_ids(),
            },
            status: TimerStatus::Pending,
            attempts: 0,
            last_error: None,
        };
        self.run_manager
            .store()
            .insert_timer(timer)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        self.run_manager
            .mark_waiting(execution.id, "delay", Some(resume_at), resume_state)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        info!(
            execution_id = %execution.id,
            node_id = %node.id,
            delay_ms = delay.as_millis() as u64,
            "delay node wrote timer, execution suspended"
        );
        // The sweeper re-enqueues; this job is done.
        Ok(NodeStep::Suspend)
    }

    /// Suspend pending an external callback: one-time token, callback URL
    /// in metadata, resume state persisted.
    async fn suspend_for_callback(
        &self,
        execution: &millrace_kernel::Execution,
        order: &[String],
        position: usize,
        node: &WorkflowNode,
        state: &mut RunState,
        wait_until: chrono::DateTime<Utc>,
    ) -> EngineResult<NodeStep> {
        let wait_until = if wait_until <= Utc::now() {
            Utc::now()
                + chrono::Duration::from_std(DEFAULT_CALLBACK_TTL)
                    .unwrap_or_else(|_| chrono::Duration::hours(24))
        } else {
            wait_until
        };

        // Mark the waiting node's slot; the callback payload replaces it.
        state.node_outputs.insert(node.id.clone(), Value::Null);
        let resume_state = build_resume_state(order, position + 1, state);

        let token = millrace_kernel::ResumeToken::new(execution.id, &node.id, wait_until);
        let callback_url = token.callback_path();
        self.run_manager
            .store()
            .insert_token(token)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        self.run_manager
            .complete_node(
                execution.id,
                &node.id,
                json!({"status": "waiting"}),
                AttemptMetadata {
                    idempotency_key: state.idempotency_keys.get(&node.id).cloned(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        self.run_manager
            .update_metadata(execution.id, move |e| {
                e.metadata.callback_url = Some(callback_url);
            })
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        self.run_manager
            .mark_waiting(execution.id, "callback", Some(wait_until), resume_state)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;

        info!(
            execution_id = %execution.id,
            node_id = %node.id,
            wait_until = %wait_until,
            "execution suspended pending callback"
        );
        Ok(NodeStep::Suspend)
    }
}

enum NodeStep {
    Continue,
    Suspend,
}

/// Where to start in the topological order for a (possibly resumed) run.
fn start_index(order: &[String], resume: Option<&ResumeState>) -> usize {
    let Some(resume) = resume else { return 0 };
    if let Some(next) = &resume.next_node_id
        && let Some(position) = order.iter().position(|id| id == next)
    {
        return position;
    }
    if let Some(first_remaining) = resume.remaining_node_ids.first()
        && let Some(position) = order.iter().position(|id| id == first_remaining)
    {
        return position;
    }
    0
}

/// The node that was waiting when a callback suspension was written: the
/// one right before `next_node_id`, or the last node when nothing remains.
fn waiting_node_id(order: &[String], resume: Option<&ResumeState>) -> Option<String> {
    let resume = resume?;
    match &resume.next_node_id {
        Some(next) => {
            let position = order.iter().position(|id| id == next)?;
            position.checked_sub(1).map(|p| order[p].clone())
        }
        None => order.last().cloned(),
    }
}

fn build_resume_state(order: &[String], next_position: usize, state: &RunState) -> ResumeState {
    ResumeState {
        node_outputs: state.node_outputs.clone(),
        prev_output: state.prev_output.clone(),
        remaining_node_ids: order[next_position.min(order.len())..].to_vec(),
        next_node_id: order.get(next_position).cloned(),
        started_at: state.started_at,
        idempotency_keys: state.idempotency_keys.clone(),
        request_hashes: state.request_hashes.clone(),
    }
}

/// Seed for deterministic idempotency keys: the trigger's dedupe token
/// when present, else the execution identity (resumes read persisted keys
/// before ever regenerating, so this only seeds the first pass).
fn deterministic_seed(trigger_data: &Value, execution_id: Uuid) -> Value {
    trigger_data
        .get("dedupeToken")
        .cloned()
        .unwrap_or_else(|| json!(execution_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_index_prefers_next_node_id() {
        let order: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let mut resume = ResumeState::new(Utc::now());
        resume.next_node_id = Some("b".into());
        resume.remaining_node_ids = vec!["b".into(), "c".into()];
        assert_eq!(start_index(&order, Some(&resume)), 1);

        resume.next_node_id = None;
        assert_eq!(start_index(&order, Some(&resume)), 1);

        assert_eq!(start_index(&order, None), 0);
    }

    #[test]
    fn waiting_node_is_predecessor_of_next() {
        let order: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let mut resume = ResumeState::new(Utc::now());
        resume.next_node_id = Some("c".into());
        assert_eq!(waiting_node_id(&order, Some(&resume)), Some("b".into()));

        resume.next_node_id = None;
        assert_eq!(waiting_node_id(&order, Some(&resume)), Some("c".into()));
    }

    #[test]
    fn deterministic_seed_prefers_dedupe_token() {
        let id = Uuid::new_v4();
        let with_token = json!({"dedupeToken": "abc"});
        assert_eq!(deterministic_seed(&with_token, id), json!("abc"));
        let without = json!({"other": 1});
        assert_eq!(deterministic_seed(&without, id), json!(id.to_string()));
    }
}
