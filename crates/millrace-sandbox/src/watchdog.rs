//! Isolation watchdog
//!
//! Counts policy violations and heartbeat misses per sandbox scope. At the
//! recycle threshold the executor is rebuilt; at the quarantine threshold
//! the scope fails fast until a successful run lifts it.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Key for one active sandbox scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub scope: String,
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ScopeKey {
    pub fn for_organization(scope: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            organization_id: organization_id.into(),
            execution_id: None,
            workflow_id: None,
            node_id: None,
        }
    }

    pub fn with_execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Watchdog thresholds.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Violations before the executor is recycled.
    pub recycle_threshold: u32,
    /// Violations before the scope is quarantined.
    pub quarantine_threshold: u32,
    /// After this long, one probe run is let through; success lifts the
    /// quarantine, another violation re-arms it.
    pub quarantine_cooldown: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            recycle_threshold: 3,
            quarantine_threshold: 5,
            quarantine_cooldown: Duration::from_secs(60),
        }
    }
}

/// What the supervisor should do after recording a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Healthy,
    Recycle,
    Quarantine,
}

#[derive(Debug, Default)]
struct ScopeHealth {
    violations: u32,
    heartbeat_misses: u32,
    quarantined_at: Option<Instant>,
    recycles: u32,
}

impl ScopeHealth {
    fn is_quarantined(&self, cooldown: Duration) -> bool {
        self.quarantined_at
            .is_some_and(|at| at.elapsed() < cooldown)
    }
}

/// Per-scope violation accounting.
pub struct IsolationWatchdog {
    config: WatchdogConfig,
    scopes: DashMap<ScopeKey, ScopeHealth>,
}

impl IsolationWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            scopes: DashMap::new(),
        }
    }

    pub fn is_quarantined(&self, key: &ScopeKey) -> bool {
        self.scopes
            .get(key)
            .is_some_and(|h| h.is_quarantined(self.config.quarantine_cooldown))
    }

    /// A successful run lifts quarantine and resets the counters.
    pub fn record_success(&self, key: &ScopeKey) {
        if let Some(mut health) = self.scopes.get_mut(key) {
            health.violations = 0;
            health.heartbeat_misses = 0;
            health.quarantined_at = None;
        }
    }

    pub fn record_violation(&self, key: &ScopeKey, heartbeat_miss: bool) -> WatchdogVerdict {
        let mut health = self.scopes.entry(key.clone()).or_default();
        health.violations += 1;
        if heartbeat_miss {
            health.heartbeat_misses += 1;
        }
        if health.violations >= self.config.quarantine_threshold {
            health.quarantined_at = Some(Instant::now());
            WatchdogVerdict::Quarantine
        } else if health.violations >= self.config.recycle_threshold {
            health.recycles += 1;
            WatchdogVerdict::Recycle
        } else {
            WatchdogVerdict::Healthy
        }
    }

    /// (violations, heartbeat misses, quarantined) for one scope.
    pub fn health(&self, key: &ScopeKey) -> (u32, u32, bool) {
        self.scopes
            .get(key)
            .map(|h| {
                (
                    h.violations,
                    h.heartbeat_misses,
                    h.is_quarantined(self.config.quarantine_cooldown),
                )
            })
            .unwrap_or((0, 0, false))
    }
}
