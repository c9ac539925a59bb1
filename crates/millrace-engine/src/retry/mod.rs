//! Retry manager
//!
//! Wraps every node operation: idempotency cache lookup, policy-driven
//! retries with exponential backoff and jitter, error classification,
//! per-(connector, node) circuit breakers, and a bounded ring of
//! actionable errors for operators.

pub mod circuit;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use millrace_kernel::{EngineError, EngineResult, ErrorCode, classify_message};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::idempotency::IdempotencyStore;
pub use circuit::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};

/// Ring capacity for actionable errors.
const ERROR_RING_CAPACITY: usize = 1_000;

/// Floor for any backoff sleep.
const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Retry policy for one node operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts; 1 means no retry.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    /// Classes eligible for retry. Empty disables retries entirely.
    pub retryable_errors: Vec<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            retryable_errors: vec![
                ErrorCode::Timeout,
                ErrorCode::RateLimit,
                ErrorCode::NetworkError,
                ErrorCode::ServiceUnavailable,
                ErrorCode::ServerError,
            ],
        }
    }
}

impl RetryPolicy {
    /// Sleep before retrying after the given 1-based attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let raw = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let with_jitter = if self.jitter_enabled {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            raw * factor
        } else {
            raw
        };
        Duration::from_millis(with_jitter as u64).max(MIN_BACKOFF)
    }

    pub fn is_retryable(&self, code: ErrorCode) -> bool {
        self.retryable_errors.contains(&code)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub policy: Option<RetryPolicy>,
    pub idempotency_key: Option<String>,
    pub node_type: Option<String>,
    pub connector_id: Option<String>,
    pub node_label: Option<String>,
    pub circuit: Option<CircuitBreakerConfig>,
}

/// Outcome status of one tracked node operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Running,
    Succeeded,
    Failed,
    Dlq,
}

/// One attempt within a tracked operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classified: Option<ErrorCode>,
    pub delay_ms: u64,
}

/// Tracked state for one `(execution, node)` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryExecution {
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: RetryStatus,
    pub attempts: Vec<AttemptRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Severity of an actionable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One operator-facing error event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionableError {
    pub execution_id: Uuid,
    pub node_id: String,
    pub code: ErrorCode,
    pub severity: Severity,
    pub message: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

/// Filter over the error ring; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ErrorFilter {
    pub execution_id: Option<Uuid>,
    pub node_id: Option<String>,
    pub code: Option<ErrorCode>,
    pub severity: Option<Severity>,
}

impl ErrorFilter {
    fn matches(&self, error: &ActionableError) -> bool {
        self.execution_id.is_none_or(|id| id == error.execution_id)
            && self
                .node_id
                .as_ref()
                .is_none_or(|node| node == &error.node_id)
            && self.code.is_none_or(|code| code == error.code)
            && self.severity.is_none_or(|sev| sev == error.severity)
    }
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RetryStats {
    pub executions: usize,
    pub cached_keys: u64,
    pub open_circuits: usize,
    pub dlq_count: u64,
    pub actionable_errors: usize,
}

/// The retry manager. One per process, shared across workers.
pub struct RetryManager {
    idempotency: Arc<IdempotencyStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    executions: DashMap<(Uuid, String), RetryExecution>,
    errors: Mutex<VecDeque<ActionableError>>,
    cache_hits: AtomicU64,
    dlq_count: AtomicU64,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl RetryManager {
    pub fn new(idempotency: Arc<IdempotencyStore>) -> Self {
        Self {
            idempotency,
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            executions: DashMap::new(),
            errors: Mutex::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
            cache_hits: AtomicU64::new(0),
            dlq_count: AtomicU64::new(0),
            cleanup: Mutex::new(None),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyStore> {
        &self.idempotency
    }

    /// Execute `op` with retries, caching and circuit breaking.
    ///
    /// `op` receives the 1-based attempt number and returns the node's JSON
    /// result.
    pub async fn execute_with_retry<F, Fut>(
        &self,
        node_id: &str,
        execution_id: Uuid,
        op: F,
        options: RetryOptions,
    ) -> EngineResult<Value>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = EngineResult<Value>>,
    {
        let now = Utc::now();

        // 1. Idempotency cache.
        if let Some(key) = &options.idempotency_key
            && let Some(record) = self.idempotency.find(execution_id, node_id, key, now).await
        {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(%execution_id, node_id, key, "idempotency cache hit");
            return Ok(record.result_data);
        }

        let policy = options.policy.clone().unwrap_or_default();
        let circuit_config = options.circuit.unwrap_or_default();
        let connector_id = options.connector_id.as_deref();

        // 2. Tracked record for this (execution, node).
        self.executions
            .entry((execution_id, node_id.to_string()))
            .or_insert_with(|| RetryExecution {
                execution_id,
                node_id: node_id.to_string(),
                status: RetryStatus::Running,
                attempts: Vec::new(),
                request_hash: None,
                created_at: now,
                updated_at: now,
            });

        let max_attempts = policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            // 3a. Circuit gate.
            if let Some(connector) = connector_id
                && let Err(snapshot) = self.breakers.check(connector, node_id, circuit_config)
            {
                let err = EngineError::CircuitOpen {
                    connector_id: connector.to_string(),
                    node_id: node_id.to_string(),
                    consecutive_failures: snapshot.consecutive_failures,
                };
                self.push_error(
                    execution_id,
                    node_id,
                    ErrorCode::CircuitOpen,
                    Severity::Warning,
                    err.to_string(),
                    serde_json::to_value(&snapshot).unwrap_or(Value::Null),
                );
                self.mark_status(execution_id, node_id, RetryStatus::Failed);
                return Err(err);
            }

            // 3b. Run the operation.
            let started_at = Utc::now();
            self.record_attempt(execution_id, node_id, attempt, started_at);

            match op(attempt).await {
                Ok(result) => {
                    // 3c. Success: cache, close breaker, return.
                    if let Some(key) = &options.idempotency_key {
                        self.idempotency
                            .store_result(execution_id, node_id, key, &result)
                            .await;
                    }
                    if let Some(connector) = connector_id {
                        self.breakers.record_success(connector, node_id, circuit_config);
                    }
                    self.mark_status(execution_id, node_id, RetryStatus::Succeeded);
                    return Ok(result);
                }
                Err(err) => {
                    // 3d. Classify and update the breaker.
                    let class = classify_error(&err);
                    self.record_attempt_error(execution_id, node_id, attempt, &err, class);

                    let opened = connector_id.and_then(|connector| {
                        self.breakers.record_failure(connector, node_id, circuit_config)
                    });

                    // 3e. Sandbox policy violations are dead on arrival.
                    if err.is_fatal_for_node() {
                        warn!(%execution_id, node_id, code = %err.code(), "sandbox violation, dead-lettering node");
                        self.dlq_count.fetch_add(1, Ordering::Relaxed);
                        self.mark_status(execution_id, node_id, RetryStatus::Dlq);
                        self.push_error(
                            execution_id,
                            node_id,
                            err.code(),
                            Severity::Critical,
                            err.to_string(),
                            Value::Null,
                        );
                        return Err(err);
                    }

                    // 3f. Breaker tripped by this failure.
                    if let Some(snapshot) = opened {
                        self.push_error(
                            execution_id,
                            node_id,
                            ErrorCode::CircuitOpen,
                            Severity::Warning,
                            format!("circuit opened by: {}", err),
                            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
                        );
                        self.mark_status(execution_id, node_id, RetryStatus::Failed);
                        return Err(EngineError::CircuitOpen {
                            connector_id: snapshot.connector_id,
                            node_id: snapshot.node_id,
                            consecutive_failures: snapshot.consecutive_failures,
                        });
                    }

                    // 3g. Out of budget or not retryable.
                    if !policy.is_retryable(class) || attempt == max_attempts {
                        let terminal = if policy.is_retryable(class) {
                            RetryStatus::Failed
                        } else {
                            // Exhausted without a retryable classification.
                            self.dlq_count.fetch_add(1, Ordering::Relaxed);
                            RetryStatus::Dlq
                        };
                        self.mark_status(execution_id, node_id, terminal);
                        self.push_error(
                            execution_id,
                            node_id,
                            class,
                            Severity::Critical,
                            err.to_string(),
                            serde_json::json!({"attempt": attempt, "max_attempts": max_attempts}),
                        );
                        return Err(err);
                    }

                    // 3h. Backoff and go again.
                    let delay = policy.delay_after(attempt);
                    debug!(
                        %execution_id,
                        node_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        class = %class,
                        "retrying after transient failure"
                    );
                    self.set_attempt_delay(execution_id, node_id, attempt, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // The loop always returns; attempts >= 1 guaranteed above.
        Err(EngineError::Internal("retry loop exhausted without outcome".into()))
    }

    /// Register a deterministic request hash for `(execution, node)`,
    /// exposed for re-enqueue correctness.
    pub fn register_request_hash(&self, execution_id: Uuid, node_id: &str, request_hash: String) {
        self.executions
            .entry((execution_id, node_id.to_string()))
            .or_insert_with(|| RetryExecution {
                execution_id,
                node_id: node_id.to_string(),
                status: RetryStatus::Running,
                attempts: Vec::new(),
                request_hash: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .request_hash = Some(request_hash);
    }

    pub fn request_hash(&self, execution_id: Uuid, node_id: &str) -> Option<String> {
        self.executions
            .get(&(execution_id, node_id.to_string()))
            .and_then(|r| r.request_hash.clone())
    }

    /// Attempts consumed so far for `(execution, node)`.
    pub fn attempt_count(&self, execution_id: Uuid, node_id: &str) -> u32 {
        self.executions
            .get(&(execution_id, node_id.to_string()))
            .map(|r| r.attempts.len() as u32)
            .unwrap_or(0)
    }

    pub fn retry_execution(&self, execution_id: Uuid, node_id: &str) -> Option<RetryExecution> {
        self.executions
            .get(&(execution_id, node_id.to_string()))
            .map(|r| r.clone())
    }

    /// Push an operator-facing error onto the bounded ring.
    pub fn push_error(
        &self,
        execution_id: Uuid,
        node_id: &str,
        code: ErrorCode,
        severity: Severity,
        message: String,
        details: Value,
    ) {
        let mut ring = self.errors.lock();
        if ring.len() >= ERROR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(ActionableError {
            execution_id,
            node_id: node_id.to_string(),
            code,
            severity,
            message,
            details,
            timestamp: Utc::now(),
        });
    }

    /// Query the error ring, newest last.
    pub fn actionable_errors(&self, filter: &ErrorFilter) -> Vec<ActionableError> {
        self.errors
            .lock()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            executions: self.executions.len(),
            cached_keys: self.cache_hits.load(Ordering::Relaxed),
            open_circuits: self.breakers.open_count(),
            dlq_count: self.dlq_count.load(Ordering::Relaxed),
            actionable_errors: self.errors.lock().len(),
        }
    }

    /// Spawn the hourly cleanup task.
    pub fn start_cleanup(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3_600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.run_cleanup().await;
            }
        });
        *self.cleanup.lock() = Some(handle);
    }

    pub fn stop_cleanup(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.abort();
        }
    }

    /// One cleanup pass: evict stale records, sweep the cache, drop idle
    /// breakers.
    pub async fn run_cleanup(&self) {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(7);
        let before = self.executions.len();
        self.executions.retain(|_, r| r.updated_at > cutoff);
        let evicted = before - self.executions.len();

        let expired = self.idempotency.delete_expired(now).await;
        let dropped = self
            .breakers
            .drop_inactive(Duration::from_secs(7 * 24 * 3_600));
        info!(evicted, expired, dropped, "retry manager cleanup pass");
    }

    fn record_attempt(&self, execution_id: Uuid, node_id: &str, attempt: u32, at: DateTime<Utc>) {
        if let Some(mut record) = self.executions.get_mut(&(execution_id, node_id.to_string())) {
            record.status = RetryStatus::Running;
            record.attempts.push(AttemptRecord {
                attempt,
                started_at: at,
                error: None,
                classified: None,
                delay_ms: 0,
            });
            record.updated_at = at;
        }
    }

    fn record_attempt_error(
        &self,
        execution_id: Uuid,
        node_id: &str,
        attempt: u32,
        error: &EngineError,
        class: ErrorCode,
    ) {
        if let Some(mut record) = self.executions.get_mut(&(execution_id, node_id.to_string()))
            && let Some(entry) = record
                .attempts
                .iter_mut()
                .rev()
                .find(|a| a.attempt == attempt)
        {
            entry.error = Some(error.to_string());
            entry.classified = Some(class);
        }
    }

    fn set_attempt_delay(&self, execution_id: Uuid, node_id: &str, attempt: u32, delay: Duration) {
        if let Some(mut record) = self.executions.get_mut(&(execution_id, node_id.to_string()))
            && let Some(entry) = record
                .attempts
                .iter_mut()
                .rev()
                .find(|a| a.attempt == attempt)
        {
            entry.delay_ms = delay.as_millis() as u64;
        }
    }

    fn mark_status(&self, execution_id: Uuid, node_id: &str, status: RetryStatus) {
        if let Some(mut record) = self.executions.get_mut(&(execution_id, node_id.to_string())) {
            record.status = status;
            record.updated_at = Utc::now();
        }
    }
}

/// Classify an engine error into the retry taxonomy: structured code
/// first, message substrings as the fallback for foreign errors.
fn classify_error(error: &EngineError) -> ErrorCode {
    match error.code() {
        ErrorCode::UnknownError | ErrorCode::Internal => classify_message(&error.to_string()),
        code => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn manager() -> Arc<RetryManager> {
        Arc::new(RetryManager::new(Arc::new(IdempotencyStore::in_memory())))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter_enabled: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn retries_transient_then_caches_result() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let execution_id = Uuid::new_v4();

        let options = RetryOptions {
            policy: Some(fast_policy(3)),
            idempotency_key: Some("k".into()),
            ..Default::default()
        };

        let calls_ref = Arc::clone(&calls);
        let result = manager
            .execute_with_retry(
                "n1",
                execution_id,
                move |_| {
                    let calls = Arc::clone(&calls_ref);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(EngineError::Other("timeout after 1s".into()))
                        } else {
                            Ok(serde_json::json!({"ok": true, "v": 42}))
                        }
                    }
                },
                options.clone(),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true, "v": 42}));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Third call: cache hit, op never invoked.
        let calls_ref = Arc::clone(&calls);
        let cached = manager
            .execute_with_retry(
                "n1",
                execution_id,
                move |_| {
                    let calls = Arc::clone(&calls_ref);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                },
                options,
            )
            .await
            .unwrap();
        assert_eq!(cached, serde_json::json!({"ok": true, "v": 42}));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(manager.stats().cached_keys >= 1);
    }

    #[tokio::test]
    async fn max_attempts_one_means_no_retry() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);

        let err = manager
            .execute_with_retry(
                "n1",
                Uuid::new_v4(),
                move |_| {
                    let calls = Arc::clone(&calls_ref);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<Value, _>(EngineError::Other("timeout".into()))
                    }
                },
                RetryOptions {
                    policy: Some(fast_policy(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_retryable_set_disables_retries() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);

        let policy = RetryPolicy {
            retryable_errors: Vec::new(),
            ..fast_policy(5)
        };
        let _ = manager
            .execute_with_retry(
                "n1",
                Uuid::new_v4(),
                move |_| {
                    let calls = Arc::clone(&calls_ref);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<Value, _>(EngineError::Other("timeout".into()))
                    }
                },
                RetryOptions {
                    policy: Some(policy),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);

        let _ = manager
            .execute_with_retry(
                "n1",
                Uuid::new_v4(),
                move |_| {
                    let calls = Arc::clone(&calls_ref);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<Value, _>(EngineError::Other("null pointer".into()))
                    }
                },
                RetryOptions {
                    policy: Some(fast_policy(5)),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sandbox_violation_dead_letters_without_retry() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);
        let execution_id = Uuid::new_v4();

        let err = manager
            .execute_with_retry(
                "n1",
                execution_id,
                move |_| {
                    let calls = Arc::clone(&calls_ref);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<Value, _>(EngineError::SandboxViolation {
                            code: ErrorCode::SandboxResourceLimit,
                            message: "cpu used 200 of 150".into(),
                        })
                    }
                },
                RetryOptions {
                    policy: Some(fast_policy(5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SandboxResourceLimit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager
                .retry_execution(execution_id, "n1")
                .unwrap()
                .status,
            RetryStatus::Dlq
        );

        let errors = manager.actionable_errors(&ErrorFilter {
            code: Some(ErrorCode::SandboxResourceLimit),
            ..Default::default()
        });
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn breaker_opens_and_rejects_next_attempt() {
        let manager = manager();
        let execution_id = Uuid::new_v4();
        let circuit = CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(60_000),
            half_open_max_attempts: 1,
        };
        let options = RetryOptions {
            policy: Some(fast_policy(1)),
            connector_id: Some("stripe".into()),
            circuit: Some(circuit),
            ..Default::default()
        };

        // Three failing calls trip the breaker (threshold 3).
        for i in 0..3 {
            let err = manager
                .execute_with_retry(
                    "n1",
                    execution_id,
                    |_| async { Err::<Value, _>(EngineError::Other("ECONNREFUSED".into())) },
                    options.clone(),
                )
                .await
                .unwrap_err();
            if i < 2 {
                assert_eq!(err.code(), ErrorCode::NetworkError);
            } else {
                // The tripping failure surfaces as CircuitOpen.
                assert_eq!(err.code(), ErrorCode::CircuitOpen);
            }
        }

        // Attempt 4: short-circuited before the op runs.
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = Arc::clone(&calls);
        let err = manager
            .execute_with_retry(
                "n1",
                execution_id,
                move |_| {
                    let calls = Arc::clone(&calls_ref);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                },
                options,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.stats().open_circuits, 1);
    }

    #[tokio::test]
    async fn error_ring_is_bounded_and_filterable() {
        let manager = manager();
        let execution_id = Uuid::new_v4();
        for i in 0..1_100 {
            manager.push_error(
                execution_id,
                &format!("n{}", i % 7),
                ErrorCode::Timeout,
                Severity::Warning,
                "slow".into(),
                Value::Null,
            );
        }
        assert_eq!(manager.stats().actionable_errors, 1_000);

        let filtered = manager.actionable_errors(&ErrorFilter {
            node_id: Some("n3".into()),
            ..Default::default()
        });
        assert!(!filtered.is_empty());
        assert!(filtered.iter().all(|e| e.node_id == "n3"));
    }

    #[tokio::test]
    async fn cleanup_evicts_old_records() {
        let manager = manager();
        let old_id = Uuid::new_v4();
        manager.register_request_hash(old_id, "n1", "hash".into());
        if let Some(mut record) = manager.executions.get_mut(&(old_id, "n1".to_string())) {
            record.updated_at = Utc::now() - chrono::Duration::days(8);
        }
        let fresh_id = Uuid::new_v4();
        manager.register_request_hash(fresh_id, "n1", "hash2".into());

        manager.run_cleanup().await;
        assert!(manager.retry_execution(old_id, "n1").is_none());
        assert!(manager.retry_execution(fresh_id, "n1").is_some());
    }

    #[test]
    fn backoff_grows_and_clamps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 3_000,
            backoff_multiplier: 2.0,
            jitter_enabled: false,
            ..Default::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(3_000));
        assert_eq!(policy.delay_after(4), Duration::from_millis(3_000));
    }

    #[test]
    fn backoff_floor_is_100ms() {
        let policy = RetryPolicy {
            initial_delay_ms: 10,
            jitter_enabled: true,
            ..Default::default()
        };
        for attempt in 1..5 {
            assert!(policy.delay_after(attempt) >= Duration::from_millis(100));
        }
    }
}
