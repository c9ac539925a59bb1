//! Tenant quotas
//!
//! Admission-time rate windows, running-slot counters, per-connector
//! concurrency slots, and the seams to the external billing service and
//! tenant directory. Counters are updated atomically under per-tenant
//! locks; windows are truly sliding (timestamp pruning, not fixed epochs)
//! and measured on the tokio clock for paused-runtime testability.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use millrace_kernel::{EngineError, EngineResult, QuotaSnapshot, Region, TenantLimits};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Sliding rate window width.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Verdict from the external billing/usage service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageVerdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

/// Billing/usage-quota seam. Implemented by the host's billing service.
#[async_trait]
pub trait UsageQuotaService: Send + Sync {
    async fn check(&self, organization_id: &str, user_id: &str) -> UsageVerdict;
}

/// Default: everything allowed.
pub struct UnlimitedUsageQuota;

#[async_trait]
impl UsageQuotaService for UnlimitedUsageQuota {
    async fn check(&self, _organization_id: &str, _user_id: &str) -> UsageVerdict {
        UsageVerdict {
            allowed: true,
            reason: None,
            plan: None,
        }
    }
}

/// Tenant profile resolved at admission.
#[derive(Debug, Clone)]
pub struct TenantProfile {
    pub region: Region,
    pub limits: TenantLimits,
    /// Per-connector concurrency caps; `default_connector_limit` fills gaps.
    pub connector_limits: std::collections::HashMap<String, u32>,
    pub default_connector_limit: u32,
}

impl Default for TenantProfile {
    fn default() -> Self {
        Self {
            region: Region::Us,
            limits: TenantLimits::default(),
            connector_limits: std::collections::HashMap::new(),
            default_connector_limit: 20,
        }
    }
}

impl TenantProfile {
    pub fn connector_limit(&self, connector_id: &str) -> u32 {
        self.connector_limits
            .get(connector_id)
            .copied()
            .unwrap_or(self.default_connector_limit)
    }
}

/// Tenant directory seam. Implemented by the host's tenancy service.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn profile(&self, organization_id: &str) -> TenantProfile;
}

/// Static directory: same profile for every tenant. Useful for tests and
/// single-tenant deployments.
pub struct StaticTenantDirectory {
    profile: TenantProfile,
}

impl StaticTenantDirectory {
    pub fn new(profile: TenantProfile) -> Self {
        Self { profile }
    }
}

impl Default for StaticTenantDirectory {
    fn default() -> Self {
        Self::new(TenantProfile::default())
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn profile(&self, _organization_id: &str) -> TenantProfile {
        self.profile.clone()
    }
}

#[derive(Default)]
struct TenantCounters {
    running: u32,
    admissions: VecDeque<Instant>,
}

/// Per-tenant running slots and rate windows.
#[derive(Default)]
pub struct TenantQuotas {
    tenants: DashMap<String, Mutex<TenantCounters>>,
}

impl TenantQuotas {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tenant<T>(&self, organization_id: &str, f: impl FnOnce(&mut TenantCounters) -> T) -> T {
        let entry = self
            .tenants
            .entry(organization_id.to_string())
            .or_default();
        let mut counters = entry.lock();
        f(&mut counters)
    }

    /// Atomically reserve one admission in the sliding 60s window, also
    /// refusing when the tenant is already at its concurrent ceiling.
    pub fn admit(
        &self,
        organization_id: &str,
        limits: &TenantLimits,
    ) -> EngineResult<QuotaSnapshot> {
        self.with_tenant(organization_id, |counters| {
            let now = Instant::now();
            while counters
                .admissions
                .front()
                .is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW)
            {
                counters.admissions.pop_front();
            }

            if counters.running >= limits.max_concurrent_executions {
                return Err(EngineError::ConcurrencyQuotaExceeded {
                    organization_id: organization_id.to_string(),
                    running: counters.running,
                    limit: limits.max_concurrent_executions,
                });
            }
            let window_count = counters.admissions.len() as u32;
            if window_count >= limits.max_executions_per_minute {
                return Err(EngineError::RateQuotaExceeded {
                    organization_id: organization_id.to_string(),
                    window_count,
                    limit: limits.max_executions_per_minute,
                });
            }

            counters.admissions.push_back(now);
            Ok(QuotaSnapshot {
                running_before_enqueue: counters.running,
                window_count: window_count + 1,
                window_start: Utc::now()
                    - chrono::Duration::from_std(RATE_WINDOW)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                limits: *limits,
            })
        })
    }

    /// Roll back an admission after an enqueue failure.
    pub fn release_admission(&self, organization_id: &str) {
        self.with_tenant(organization_id, |counters| {
            counters.admissions.pop_back();
        });
    }

    /// Try to take one running slot; `false` when the tenant is full.
    pub fn try_reserve_running(&self, organization_id: &str, limits: &TenantLimits) -> bool {
        self.with_tenant(organization_id, |counters| {
            if counters.running >= limits.max_concurrent_executions {
                false
            } else {
                counters.running += 1;
                true
            }
        })
    }

    pub fn release_running(&self, organization_id: &str) {
        self.with_tenant(organization_id, |counters| {
            counters.running = counters.running.saturating_sub(1);
        });
    }

    pub fn running(&self, organization_id: &str) -> u32 {
        self.with_tenant(organization_id, |counters| counters.running)
    }
}

/// Per-(tenant, connector) in-flight slots.
#[derive(Default)]
pub struct ConnectorSlots {
    slots: DashMap<(String, String), u32>,
}

impl ConnectorSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admission check: every connector in the workflow must have headroom.
    pub fn check_available(
        &self,
        organization_id: &str,
        connectors: &[String],
        profile: &TenantProfile,
    ) -> EngineResult<()> {
        for connector in connectors {
            let limit = profile.connector_limit(connector);
            let used = self
                .slots
                .get(&(organization_id.to_string(), connector.clone()))
                .map(|v| *v)
                .unwrap_or(0);
            if used >= limit {
                return Err(EngineError::ConnectorConcurrencyExceeded {
                    connector_id: connector.clone(),
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Take one slot per connector for a claimed job.
    pub fn register(&self, organization_id: &str, connectors: &[String]) {
        for connector in connectors {
            *self
                .slots
                .entry((organization_id.to_string(), connector.clone()))
                .or_insert(0) += 1;
        }
        if !connectors.is_empty() {
            debug!(organization_id, count = connectors.len(), "registered connector slots");
        }
    }

    pub fn release(&self, organization_id: &str, connectors: &[String]) {
        for connector in connectors {
            if let Some(mut slot) = self
                .slots
                .get_mut(&(organization_id.to_string(), connector.clone()))
            {
                *slot = slot.saturating_sub(1);
            }
        }
    }

    pub fn in_use(&self, organization_id: &str, connector_id: &str) -> u32 {
        self.slots
            .get(&(organization_id.to_string(), connector_id.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(concurrent: u32, per_minute: u32) -> TenantLimits {
        TenantLimits {
            max_concurrent_executions: concurrent,
            max_executions_per_minute: per_minute,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_window_slides() {
        let quotas = TenantQuotas::new();
        let limits = limits(100, 2);

        assert!(quotas.admit("org-1", &limits).is_ok());
        assert!(quotas.admit("org-1", &limits).is_ok());
        let err = quotas.admit("org-1", &limits).unwrap_err();
        assert!(matches!(err, EngineError::RateQuotaExceeded { .. }));

        // 61 seconds later the window has slid past both admissions.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(quotas.admit("org-1", &limits).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_window_never_exceeds_limit() {
        let quotas = TenantQuotas::new();
        let limits = limits(100, 5);
        let mut admitted_at: VecDeque<Instant> = VecDeque::new();

        // Try an admission every 10s for 3 minutes; count per window.
        for _ in 0..18 {
            if quotas.admit("org-1", &limits).is_ok() {
                admitted_at.push_back(Instant::now());
            }
            let now = Instant::now();
            while admitted_at
                .front()
                .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(60))
            {
                admitted_at.pop_front();
            }
            assert!(admitted_at.len() as u32 <= limits.max_executions_per_minute);
            tokio::time::advance(Duration::from_secs(10)).await;
        }
    }

    #[tokio::test]
    async fn running_slots_cap_and_release() {
        let quotas = TenantQuotas::new();
        let limits = limits(2, 100);

        assert!(quotas.try_reserve_running("org-1", &limits));
        assert!(quotas.try_reserve_running("org-1", &limits));
        assert!(!quotas.try_reserve_running("org-1", &limits));
        assert_eq!(quotas.running("org-1"), 2);

        quotas.release_running("org-1");
        assert!(quotas.try_reserve_running("org-1", &limits));
    }

    #[tokio::test]
    async fn admission_refused_at_concurrency_ceiling() {
        let quotas = TenantQuotas::new();
        let limits = limits(1, 100);
        assert!(quotas.try_reserve_running("org-1", &limits));
        let err = quotas.admit("org-1", &limits).unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyQuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn release_admission_rolls_back_window_slot() {
        let quotas = TenantQuotas::new();
        let limits = limits(100, 1);
        assert!(quotas.admit("org-1", &limits).is_ok());
        quotas.release_admission("org-1");
        assert!(quotas.admit("org-1", &limits).is_ok());
    }

    #[tokio::test]
    async fn connector_slots_enforced_per_tenant() {
        let slots = ConnectorSlots::new();
        let mut profile = TenantProfile::default();
        profile.connector_limits.insert("stripe".into(), 1);
        let connectors = vec!["stripe".to_string()];

        slots.check_available("org-1", &connectors, &profile).unwrap();
        slots.register("org-1", &connectors);
        let err = slots
            .check_available("org-1", &connectors, &profile)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConnectorConcurrencyExceeded { .. }
        ));

        // Another tenant is unaffected.
        slots.check_available("org-2", &connectors, &profile).unwrap();

        slots.release("org-1", &connectors);
        slots.check_available("org-1", &connectors, &profile).unwrap();
    }
}
