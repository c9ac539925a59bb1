//! Circuit breakers
//!
//! Three-state breakers keyed by `(connector, node)`. Transitions are the
//! only legal ones: `Closed→Open`, `Open→HalfOpen` after cooldown,
//! `HalfOpen→Open` on failure, `HalfOpen→Closed` on success. Each key has
//! its own lock; transitions are atomic under it.
//!
//! Cooldowns are measured on the tokio clock so breaker behavior is
//! testable under a paused runtime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Breaker tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_millis(60_000),
            half_open_max_attempts: 1,
        }
    }
}

mod duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Serializable view of one breaker, persisted into execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub connector_id: String,
    pub node_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_recovery_at: Option<DateTime<Utc>>,
    pub half_open_attempts: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_attempts: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_recovery_at: Option<DateTime<Utc>>,
    last_touched: Instant,
    config: CircuitBreakerConfig,
}

impl BreakerInner {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_attempts: 0,
            opened_at: None,
            opened_at_wall: None,
            last_failure_at: None,
            last_recovery_at: None,
            last_touched: Instant::now(),
            config,
        }
    }

    fn snapshot(&self, connector_id: &str, node_id: &str) -> CircuitSnapshot {
        CircuitSnapshot {
            connector_id: connector_id.to_string(),
            node_id: node_id.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at_wall,
            last_failure_at: self.last_failure_at,
            last_recovery_at: self.last_recovery_at,
            half_open_attempts: self.half_open_attempts,
        }
    }
}

type BreakerKey = (String, String);

/// Process-wide breaker registry.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<BreakerKey, Mutex<BreakerInner>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_breaker<T>(
        &self,
        connector_id: &str,
        node_id: &str,
        config: CircuitBreakerConfig,
        f: impl FnOnce(&mut BreakerInner) -> T,
    ) -> T {
        let key = (connector_id.to_string(), node_id.to_string());
        let entry = self
            .breakers
            .entry(key)
            .or_insert_with(|| Mutex::new(BreakerInner::new(config)));
        let mut inner = entry.lock();
        inner.last_touched = Instant::now();
        f(&mut inner)
    }

    /// Admission gate before an attempt. `Err(snapshot)` means the call is
    /// short-circuited.
    pub fn check(
        &self,
        connector_id: &str,
        node_id: &str,
        config: CircuitBreakerConfig,
    ) -> Result<(), CircuitSnapshot> {
        self.with_breaker(connector_id, node_id, config, |inner| {
            match inner.state {
                CircuitState::Closed => Ok(()),
                CircuitState::Open => {
                    let cooled = inner
                        .opened_at
                        .is_some_and(|at| at.elapsed() >= inner.config.cooldown);
                    if cooled {
                        debug!(connector_id, node_id, "circuit cooldown elapsed, probing");
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_attempts = 1;
                        Ok(())
                    } else {
                        Err(inner.snapshot(connector_id, node_id))
                    }
                }
                CircuitState::HalfOpen => {
                    inner.half_open_attempts += 1;
                    if inner.half_open_attempts > inner.config.half_open_max_attempts {
                        Err(inner.snapshot(connector_id, node_id))
                    } else {
                        Ok(())
                    }
                }
            }
        })
    }

    /// Any success closes the breaker and resets its failure count.
    pub fn record_success(&self, connector_id: &str, node_id: &str, config: CircuitBreakerConfig) {
        self.with_breaker(connector_id, node_id, config, |inner| {
            if inner.state != CircuitState::Closed {
                debug!(connector_id, node_id, from = %inner.state, "circuit closing");
            }
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.half_open_attempts = 0;
            inner.opened_at = None;
            inner.opened_at_wall = None;
            inner.last_recovery_at = Some(Utc::now());
        });
    }

    /// Record a failure. Returns the snapshot if the breaker is now open.
    pub fn record_failure(
        &self,
        connector_id: &str,
        node_id: &str,
        config: CircuitBreakerConfig,
    ) -> Option<CircuitSnapshot> {
        self.with_breaker(connector_id, node_id, config, |inner| {
            inner.consecutive_failures += 1;
            inner.last_failure_at = Some(Utc::now());

            let should_open = inner.state == CircuitState::HalfOpen
                || inner.consecutive_failures >= inner.config.failure_threshold;
            if should_open && inner.state != CircuitState::Open {
                warn!(
                    connector_id,
                    node_id,
                    consecutive_failures = inner.consecutive_failures,
                    "circuit opening"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.opened_at_wall = Some(Utc::now());
                inner.half_open_attempts = 0;
            }
            if inner.state == CircuitState::Open {
                Some(inner.snapshot(connector_id, node_id))
            } else {
                None
            }
        })
    }

    pub fn snapshot(&self, connector_id: &str, node_id: &str) -> Option<CircuitSnapshot> {
        let key = (connector_id.to_string(), node_id.to_string());
        self.breakers
            .get(&key)
            .map(|entry| entry.lock().snapshot(connector_id, node_id))
    }

    /// Currently-open breakers, for rollups.
    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| entry.lock().state == CircuitState::Open)
            .count()
    }

    /// Drop closed breakers untouched for `idle`. Returns how many.
    pub fn drop_inactive(&self, idle: Duration) -> usize {
        let before = self.breakers.len();
        self.breakers.retain(|_, entry| {
            let inner = entry.lock();
            inner.state != CircuitState::Closed || inner.last_touched.elapsed() < idle
        });
        before - self.breakers.len()
    }
}
