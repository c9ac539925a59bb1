//! Environment configuration
//!
//! Every tunable the engine honors is an environment variable with a
//! documented default. `EngineConfig::from_env()` is the single place the
//! process environment is read; everything downstream receives the parsed
//! struct.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Data residency region. Determines queue, storage and scheduler affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[default]
    Us,
    Eu,
    Apac,
}

impl Region {
    /// Name of the region-local execution queue.
    pub fn execute_queue(&self) -> String {
        format!("workflow.execute.{}", self)
    }

    /// Name of the region-local run-step queue.
    pub fn run_step_queue(&self) -> String {
        format!("workflow.run-step.{}", self)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Region::Us => write!(f, "us"),
            Region::Eu => write!(f, "eu"),
            Region::Apac => write!(f, "apac"),
        }
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "us" => Ok(Region::Us),
            "eu" => Ok(Region::Eu),
            "apac" => Ok(Region::Apac),
            other => Err(format!("unknown region '{}'", other)),
        }
    }
}

/// Queue driver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueDriver {
    /// Durable driver injected by the host process.
    Durable,
    /// Built-in in-memory driver.
    #[default]
    InMemory,
}

impl FromStr for QueueDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "durable" => Ok(QueueDriver::Durable),
            "inmemory" | "in-memory" | "memory" => Ok(QueueDriver::InMemory),
            other => Err(format!("unknown queue driver '{}'", other)),
        }
    }
}

/// Sandbox executor selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxExecutorKind {
    /// Worker-thread executor; CPU enforcement delegated to engine limits.
    Worker,
    /// Fresh child process per call with OS resource limits.
    #[default]
    Process,
}

impl FromStr for SandboxExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "worker" | "thread" => Ok(SandboxExecutorKind::Worker),
            "process" | "subprocess" => Ok(SandboxExecutorKind::Process),
            other => Err(format!("unknown sandbox executor '{}'", other)),
        }
    }
}

/// Sandbox tunables sourced from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEnvConfig {
    /// Total CPU-time budget per call. Unset disables CPU enforcement.
    pub max_cpu_ms: Option<u64>,
    /// cgroup cpu.max quota per 100ms period.
    pub cpu_quota_ms: Option<u64>,
    /// Resident-set ceiling. Unset disables memory enforcement.
    pub max_memory_mb: Option<u64>,
    /// cgroup v2 root to create per-execution cgroups under.
    pub cgroup_root: Option<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub executor: SandboxExecutorKind,
}

impl Default for SandboxEnvConfig {
    fn default() -> Self {
        Self {
            max_cpu_ms: None,
            cpu_quota_ms: None,
            max_memory_mb: None,
            cgroup_root: None,
            heartbeat_interval: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_millis(3_000),
            executor: SandboxExecutorKind::Process,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global in-flight job ceiling per worker process (N).
    pub worker_concurrency: usize,
    /// Per-tenant in-flight ceiling (T). Clamped to `worker_concurrency`.
    pub tenant_concurrency: usize,
    /// Queue-level redeliveries: a failed job is retried `max_retries` times.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Queue lock duration; the lease expires this long after the last renewal.
    pub lock_duration: Duration,
    /// How often the heartbeat pump renews the queue lock.
    pub lock_renew: Duration,
    pub heartbeat_interval: Duration,
    /// Heartbeat drift beyond this lets the queue reclaim the job.
    pub heartbeat_timeout: Duration,
    /// How often the in-memory lease is persisted back to the execution row.
    pub heartbeat_persist: Duration,
    pub region: Region,
    pub queue_driver: QueueDriver,
    /// Enables the generic connector fallback path.
    pub generic_executor_enabled: bool,
    pub sandbox: SandboxEnvConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 10,
            tenant_concurrency: 4,
            max_retries: 3,
            retry_delay: Duration::from_millis(1_000),
            max_retry_delay: Duration::from_millis(30_000),
            lock_duration: Duration::from_millis(60_000),
            lock_renew: Duration::from_millis(15_000),
            heartbeat_interval: Duration::from_millis(5_000),
            heartbeat_timeout: Duration::from_millis(30_000),
            heartbeat_persist: Duration::from_millis(15_000),
            region: Region::Us,
            queue_driver: QueueDriver::InMemory,
            generic_executor_enabled: false,
            sandbox: SandboxEnvConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the process environment.
    ///
    /// Unparseable values fall back to the default for that field; a
    /// missing variable is not an error.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let sandbox = SandboxEnvConfig {
            max_cpu_ms: env_parse("SANDBOX_MAX_CPU_MS"),
            cpu_quota_ms: env_parse("SANDBOX_CPU_QUOTA_MS"),
            max_memory_mb: env_parse("SANDBOX_MAX_MEMORY_MB"),
            cgroup_root: std::env::var("SANDBOX_CGROUP_ROOT").ok().filter(|s| !s.is_empty()),
            heartbeat_interval: env_duration_ms(
                "SANDBOX_HEARTBEAT_INTERVAL_MS",
                defaults.sandbox.heartbeat_interval,
            ),
            heartbeat_timeout: env_duration_ms(
                "SANDBOX_HEARTBEAT_TIMEOUT_MS",
                defaults.sandbox.heartbeat_timeout,
            ),
            executor: env_parse("SANDBOX_EXECUTOR").unwrap_or(defaults.sandbox.executor),
        };

        let worker_concurrency =
            env_parse("EXECUTION_WORKER_CONCURRENCY").unwrap_or(defaults.worker_concurrency);
        let tenant_concurrency = env_parse("EXECUTION_TENANT_CONCURRENCY")
            .unwrap_or(defaults.tenant_concurrency)
            .min(worker_concurrency);

        Self {
            worker_concurrency,
            tenant_concurrency,
            max_retries: env_parse("EXECUTION_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_delay: env_duration_ms("EXECUTION_RETRY_DELAY_MS", defaults.retry_delay),
            max_retry_delay: env_duration_ms(
                "EXECUTION_MAX_RETRY_DELAY_MS",
                defaults.max_retry_delay,
            ),
            lock_duration: env_duration_ms("EXECUTION_LOCK_DURATION_MS", defaults.lock_duration),
            lock_renew: env_duration_ms("EXECUTION_LOCK_RENEW_MS", defaults.lock_renew),
            heartbeat_interval: env_duration_ms(
                "EXECUTION_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env_duration_ms(
                "EXECUTION_HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout,
            ),
            heartbeat_persist: env_duration_ms(
                "EXECUTION_HEARTBEAT_PERSIST_MS",
                defaults.heartbeat_persist,
            ),
            region: env_parse("DATA_RESIDENCY_REGION").unwrap_or(defaults.region),
            queue_driver: env_parse("QUEUE_DRIVER").unwrap_or(defaults.queue_driver),
            generic_executor_enabled: env_parse("GENERIC_EXECUTOR_ENABLED")
                .unwrap_or(defaults.generic_executor_enabled),
            sandbox,
        }
    }

    /// The sandbox heartbeat timeout floor: at least twice the interval.
    pub fn effective_sandbox_heartbeat_timeout(&self) -> Duration {
        self.sandbox
            .heartbeat_timeout
            .max(self.sandbox.heartbeat_interval * 2)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_queue_names() {
        assert_eq!(Region::Us.execute_queue(), "workflow.execute.us");
        assert_eq!(Region::Eu.run_step_queue(), "workflow.run-step.eu");
    }

    #[test]
    fn region_parses_case_insensitively() {
        assert_eq!("EU".parse::<Region>().unwrap(), Region::Eu);
        assert_eq!(" apac ".parse::<Region>().unwrap(), Region::Apac);
        assert!("mars".parse::<Region>().is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.tenant_concurrency <= cfg.worker_concurrency);
        assert_eq!(cfg.queue_driver, QueueDriver::InMemory);
        assert!(!cfg.generic_executor_enabled);
    }

    #[test]
    fn heartbeat_timeout_floor_is_twice_interval() {
        let mut cfg = EngineConfig::default();
        cfg.sandbox.heartbeat_interval = Duration::from_millis(2_000);
        cfg.sandbox.heartbeat_timeout = Duration::from_millis(3_000);
        assert_eq!(
            cfg.effective_sandbox_heartbeat_timeout(),
            Duration::from_millis(4_000)
        );
    }
}
