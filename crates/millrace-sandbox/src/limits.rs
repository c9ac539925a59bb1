//! OS resource enforcement
//!
//! Three mechanisms, best available wins: a per-execution cgroup (v2) when
//! a cgroup root is configured, `setrlimit` applied inside the child
//! otherwise, and 200ms usage polling from the parent as the backstop that
//! also produces the structured `ResourceLimit` error.

use std::io;
use std::path::PathBuf;

use rand::Rng;
use tracing::{debug, warn};

use crate::policy::ResourceLimits;

/// A per-execution cgroup under the configured root. Removed on drop.
#[derive(Debug)]
pub struct CgroupScope {
    path: PathBuf,
}

impl CgroupScope {
    /// Create `exec-<rand>` under `root` and write the configured limits.
    pub fn create(root: &str, limits: &ResourceLimits) -> io::Result<Self> {
        let name = format!("exec-{:08x}", rand::thread_rng().r#gen::<u32>());
        let path = PathBuf::from(root).join(name);
        std::fs::create_dir(&path)?;

        if let Some(memory_bytes) = limits.memory_bytes {
            std::fs::write(path.join("memory.max"), format!("{}\n", memory_bytes))?;
        }
        if let Some(quota_ms) = limits.cpu_quota_ms {
            // cpu.max is "<quota-us> <period-us>" with a 100ms period.
            std::fs::write(
                path.join("cpu.max"),
                format!("{} 100000\n", quota_ms.saturating_mul(1_000)),
            )?;
        }
        debug!(path = %path.display(), "created execution cgroup");
        Ok(Self { path })
    }

    /// Attach a process to this cgroup.
    pub fn attach(&self, pid: u32) -> io::Result<()> {
        std::fs::write(self.path.join("cgroup.procs"), format!("{}\n", pid))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for CgroupScope {
    fn drop(&mut self) {
        // On cgroupfs the directory is removable once empty of processes;
        // the recursive fallback covers plain-filesystem test fixtures.
        if std::fs::remove_dir(&self.path).is_err()
            && let Err(e) = std::fs::remove_dir_all(&self.path)
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove execution cgroup");
        }
    }
}

/// Apply rlimits to the current process. Called by the sandbox child when
/// no cgroup is in play.
#[cfg(unix)]
pub fn apply_rlimits(limits: &ResourceLimits) {
    if let Some(cpu_ms) = limits.cpu_ms {
        // RLIMIT_CPU has second granularity; round up so short budgets do
        // not become zero (which would kill the child immediately).
        let secs = cpu_ms.div_ceil(1_000).max(1);
        let rlim = libc::rlimit {
            rlim_cur: secs,
            rlim_max: secs + 1,
        };
        let rc = unsafe { libc::setrlimit(libc::RLIMIT_CPU, &rlim) };
        if rc != 0 {
            warn!(error = %io::Error::last_os_error(), "setrlimit(RLIMIT_CPU) failed");
        }
    }
    if let Some(memory_bytes) = limits.memory_bytes {
        let rlim = libc::rlimit {
            rlim_cur: memory_bytes,
            rlim_max: memory_bytes,
        };
        let rc = unsafe { libc::setrlimit(libc::RLIMIT_AS, &rlim) };
        if rc != 0 {
            warn!(error = %io::Error::last_os_error(), "setrlimit(RLIMIT_AS) failed");
        }
    }
}

#[cfg(not(unix))]
pub fn apply_rlimits(_limits: &ResourceLimits) {}

/// A point-in-time usage sample for one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcUsage {
    /// User + system CPU time.
    pub cpu_ms: u64,
    /// Resident set size.
    pub rss_bytes: u64,
}

/// Sample CPU and RSS for a pid from procfs. Returns `None` when the
/// process is gone or the platform has no procfs.
#[cfg(target_os = "linux")]
pub fn sample_proc_usage(pid: u32) -> Option<ProcUsage> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Fields 14 and 15 (utime, stime) in clock ticks, counted after the
    // parenthesized comm field, which may itself contain spaces.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    let ticks_per_sec = if ticks_per_sec > 0 { ticks_per_sec as u64 } else { 100 };
    let cpu_ms = (utime + stime) * 1_000 / ticks_per_sec;

    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let rss_kb: u64 = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
        .unwrap_or(0);

    Some(ProcUsage {
        cpu_ms,
        rss_bytes: rss_kb * 1024,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn sample_proc_usage(_pid: u32) -> Option<ProcUsage> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_scope_writes_limit_files_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let limits = ResourceLimits {
            memory_bytes: Some(64 * 1024 * 1024),
            cpu_quota_ms: Some(50),
            ..Default::default()
        };
        let scope = CgroupScope::create(root.path().to_str().unwrap(), &limits).unwrap();
        let path = scope.path().to_path_buf();

        assert_eq!(
            std::fs::read_to_string(path.join("memory.max")).unwrap(),
            "67108864\n"
        );
        assert_eq!(
            std::fs::read_to_string(path.join("cpu.max")).unwrap(),
            "50000 100000\n"
        );

        drop(scope);
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sampling_own_process_works() {
        let usage = sample_proc_usage(std::process::id()).unwrap();
        assert!(usage.rss_bytes > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sampling_dead_pid_returns_none() {
        assert!(sample_proc_usage(u32::MAX - 7).is_none());
    }
}
