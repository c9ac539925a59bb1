//! Sandbox policy and tenancy overlay
//!
//! The effective policy for one call is the tenancy base config merged with
//! per-call overrides: any set override wins, environment defaults fill
//! unset fields. If neither a CPU nor a memory limit remains, resource
//! enforcement is disabled.

use std::time::Duration;

use millrace_kernel::SandboxEnvConfig;
use serde::{Deserialize, Serialize};

use crate::net::{HostRule, NetworkRules};

/// Resource ceilings for one sandbox call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Total CPU time budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<u64>,
    /// cgroup cpu.max quota per 100ms period.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_quota_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    /// cgroup v2 root; `None` falls back to setrlimit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_root: Option<String>,
}

impl ResourceLimits {
    /// Enforcement is disabled when no ceiling is set at all.
    pub fn is_enforced(&self) -> bool {
        self.cpu_ms.is_some() || self.memory_bytes.is_some()
    }

    /// Overlay: any field set on `over` wins.
    pub fn overlaid(&self, over: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_ms: over.cpu_ms.or(self.cpu_ms),
            cpu_quota_ms: over.cpu_quota_ms.or(self.cpu_quota_ms),
            memory_bytes: over.memory_bytes.or(self.memory_bytes),
            cgroup_root: over.cgroup_root.clone().or_else(|| self.cgroup_root.clone()),
        }
    }
}

/// Effective sandbox policy for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub limits: ResourceLimits,
    pub network: NetworkRules,
    /// Connector-declared hosts merged into the allow set.
    #[serde(default)]
    pub required_outbound: Vec<HostRule>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Script packages the tenant may import. Empty means imports are
    /// rejected outright, which is the only mode the runtime supports today.
    #[serde(default)]
    pub dependency_allowlist: Vec<String>,
    #[serde(default)]
    pub secret_scopes: Vec<String>,
    pub policy_version: u32,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            network: NetworkRules::default(),
            required_outbound: Vec::new(),
            heartbeat_interval: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_millis(3_000),
            dependency_allowlist: Vec::new(),
            secret_scopes: Vec::new(),
            policy_version: 1,
        }
    }
}

impl SandboxPolicy {
    /// Heartbeat timeout floor: at least twice the interval.
    pub fn effective_heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout.max(self.heartbeat_interval * 2)
    }

    /// Network rules with required outbound hosts merged in.
    pub fn effective_network(&self) -> NetworkRules {
        let mut rules = self.network.clone();
        rules.merge_required_outbound(&self.required_outbound);
        rules
    }
}

/// Per-tenant base configuration owned by the tenancy config service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenancyConfig {
    pub limits: ResourceLimits,
    pub network: NetworkRules,
    #[serde(default)]
    pub dependency_allowlist: Vec<String>,
    #[serde(default)]
    pub secret_scopes: Vec<String>,
    #[serde(default = "default_policy_version")]
    pub policy_version: u32,
}

fn default_policy_version() -> u32 {
    1
}

/// Per-call overrides supplied by the node or connector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkRules>,
    #[serde(default)]
    pub required_outbound: Vec<HostRule>,
}

impl TenancyConfig {
    /// Build the effective policy for one call.
    ///
    /// Precedence per field: call override, then tenancy base, then
    /// environment default.
    pub fn effective_policy(
        &self,
        env: &SandboxEnvConfig,
        overrides: &PolicyOverrides,
    ) -> SandboxPolicy {
        let env_limits = ResourceLimits {
            cpu_ms: env.max_cpu_ms,
            cpu_quota_ms: env.cpu_quota_ms,
            memory_bytes: env.max_memory_mb.map(|mb| mb * 1024 * 1024),
            cgroup_root: env.cgroup_root.clone(),
        };
        let limits = env_limits.overlaid(&self.limits).overlaid(&overrides.limits);

        let network = overrides.network.clone().unwrap_or_else(|| self.network.clone());

        SandboxPolicy {
            limits,
            network,
            required_outbound: overrides.required_outbound.clone(),
            heartbeat_interval: env.heartbeat_interval,
            heartbeat_timeout: env.heartbeat_timeout,
            dependency_allowlist: self.dependency_allowlist.clone(),
            secret_scopes: self.secret_scopes.clone(),
            policy_version: self.policy_version,
        }
    }
}
