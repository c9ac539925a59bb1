//! In-memory execution store
//!
//! Reference implementation of [`ExecutionStore`] for single-node mode and
//! tests. Durable backends implement the same trait over their tables.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use millrace_kernel::{
    AttemptStatus, Execution, NodeAttempt, ResumeToken, TimerStatus, WorkflowTimer,
};
use parking_lot::RwLock;
use uuid::Uuid;

use super::entities::{
    ExecutionQuery, ExecutionSort, RunStoreError, RunStoreResult,
};
use super::ExecutionStore;

#[derive(Default)]
struct StoreState {
    executions: HashMap<Uuid, Execution>,
    /// (execution, node) → attempts ordered by attempt number.
    attempts: HashMap<(Uuid, String), Vec<NodeAttempt>>,
    timers: HashMap<Uuid, WorkflowTimer>,
    tokens: HashMap<Uuid, ResumeToken>,
}

/// In-memory store behind one RwLock; fine for a single worker process.
#[derive(Default)]
pub struct MemoryExecutionStore {
    state: RwLock<StoreState>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert_execution(&self, execution: Execution) -> RunStoreResult<()> {
        self.state
            .write()
            .executions
            .insert(execution.id, execution);
        Ok(())
    }

    async fn update_execution(&self, execution: Execution) -> RunStoreResult<()> {
        let mut state = self.state.write();
        if !state.executions.contains_key(&execution.id) {
            return Err(RunStoreError::ExecutionNotFound(execution.id));
        }
        state.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> RunStoreResult<Option<Execution>> {
        Ok(self.state.read().executions.get(&id).cloned())
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> RunStoreResult<Option<Execution>> {
        Ok(self
            .state
            .read()
            .executions
            .values()
            .find(|e| e.correlation_id == correlation_id)
            .cloned())
    }

    async fn list_executions(&self, query: &ExecutionQuery) -> RunStoreResult<Vec<Execution>> {
        let state = self.state.read();
        let mut matches: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| {
                query
                    .workflow_id
                    .as_ref()
                    .is_none_or(|w| &e.workflow_id == w)
                    && query
                        .organization_id
                        .as_ref()
                        .is_none_or(|o| &e.organization_id == o)
                    && query
                        .user_id
                        .as_ref()
                        .is_none_or(|u| e.user_id.as_ref() == Some(u))
                    && (query.status.is_empty() || query.status.contains(&e.status))
                    && query.date_from.is_none_or(|from| e.started_at >= from)
                    && query.date_to.is_none_or(|to| e.started_at <= to)
                    && query.tags.iter().all(|t| e.tags.contains(t))
            })
            .cloned()
            .collect();

        match query.sort {
            ExecutionSort::StartedAtDesc => {
                matches.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            }
            ExecutionSort::StartedAtAsc => {
                matches.sort_by(|a, b| a.started_at.cmp(&b.started_at));
            }
            ExecutionSort::DurationDesc => {
                matches.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
            }
        }

        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        Ok(matches.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn put_attempt(&self, attempt: NodeAttempt) -> RunStoreResult<()> {
        let mut state = self.state.write();
        let key = (attempt.execution_id, attempt.node_id.clone());
        let attempts = state.attempts.entry(key).or_default();

        // At most one running attempt per (execution, node).
        if attempt.status == AttemptStatus::Running
            && attempts
                .iter()
                .any(|a| a.status == AttemptStatus::Running && a.attempt != attempt.attempt)
        {
            return Err(RunStoreError::AttemptAlreadyRunning {
                execution_id: attempt.execution_id,
                node_id: attempt.node_id.clone(),
            });
        }

        match attempts.iter_mut().find(|a| a.attempt == attempt.attempt) {
            Some(existing) => *existing = attempt,
            None => attempts.push(attempt),
        }
        Ok(())
    }

    async fn get_attempts(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> RunStoreResult<Vec<NodeAttempt>> {
        Ok(self
            .state
            .read()
            .attempts
            .get(&(execution_id, node_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn attempts_for_execution(&self, execution_id: Uuid) -> RunStoreResult<Vec<NodeAttempt>> {
        let state = self.state.read();
        let mut all: Vec<NodeAttempt> = state
            .attempts
            .iter()
            .filter(|((id, _), _)| *id == execution_id)
            .flat_map(|(_, attempts)| attempts.iter().cloned())
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(all)
    }

    async fn insert_timer(&self, timer: WorkflowTimer) -> RunStoreResult<()> {
        self.state.write().timers.insert(timer.id, timer);
        Ok(())
    }

    async fn claim_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> RunStoreResult<Vec<WorkflowTimer>> {
        let mut state = self.state.write();
        let mut claimed = Vec::new();
        for timer in state.timers.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            // Compare-and-set pending → in_flight.
            if timer.status == TimerStatus::Pending && timer.resume_at <= now {
                timer.status = TimerStatus::InFlight;
                claimed.push(timer.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_timer(&self, id: Uuid) -> RunStoreResult<()> {
        let mut state = self.state.write();
        let timer = state
            .timers
            .get_mut(&id)
            .ok_or(RunStoreError::TimerNotFound(id))?;
        timer.status = TimerStatus::Completed;
        Ok(())
    }

    async fn fail_timer(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> RunStoreResult<()> {
        let mut state = self.state.write();
        let timer = state
            .timers
            .get_mut(&id)
            .ok_or(RunStoreError::TimerNotFound(id))?;
        timer.attempts += 1;
        timer.last_error = Some(error.to_string());
        timer.status = TimerStatus::Pending;
        timer.resume_at = retry_at;
        Ok(())
    }

    async fn get_timer(&self, id: Uuid) -> RunStoreResult<Option<WorkflowTimer>> {
        Ok(self.state.read().timers.get(&id).cloned())
    }

    async fn insert_token(&self, token: ResumeToken) -> RunStoreResult<()> {
        self.state.write().tokens.insert(token.id, token);
        Ok(())
    }

    async fn consume_token(&self, id: Uuid, now: DateTime<Utc>) -> RunStoreResult<ResumeToken> {
        let mut state = self.state.write();
        let token = state
            .tokens
            .get_mut(&id)
            .ok_or_else(|| RunStoreError::TokenInvalid(format!("unknown token {}", id)))?;
        if token.consumed {
            return Err(RunStoreError::TokenInvalid("token already used".into()));
        }
        if now > token.expires_at {
            return Err(RunStoreError::TokenInvalid("token expired".into()));
        }
        token.consumed = true;
        Ok(token.clone())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> RunStoreResult<usize> {
        let mut state = self.state.write();
        let doomed: Vec<Uuid> = state
            .executions
            .values()
            .filter(|e| e.status.is_terminal() && e.started_at < cutoff)
            .map(|e| e.id)
            .collect();
        for id in &doomed {
            state.executions.remove(id);
            state.attempts.retain(|(execution_id, _), _| execution_id != id);
            state.timers.retain(|_, t| t.execution_id != *id);
            state.tokens.retain(|_, t| t.execution_id != *id);
        }
        Ok(doomed.len())
    }
}
