//! Cgroups v2 resource limits

use crate::config::SandboxPolicy;
use crate::{RenderwardError, Result};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Tasks allowed per permitted process; a renderer runs many threads
pub const TASKS_PER_PROCESS: u32 = 64;

const CPU_PERIOD_US: u64 = 100_000;

/// Limits for one renderer cgroup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupLimits {
    /// memory.max, bytes
    pub memory_max: u64,
    /// cpu.max quota as a percentage of one CPU
    pub cpu_percent: u32,
    /// pids.max
    pub pids_max: u32,
}

impl CgroupLimits {
    #[must_use]
    pub fn from_policy(policy: &SandboxPolicy) -> Self {
        Self {
            memory_max: policy.max_memory_mb.saturating_mul(1024 * 1024),
            cpu_percent: policy.max_cpu_percent,
            pids_max: policy.max_active_processes.saturating_mul(TASKS_PER_PROCESS),
        }
    }

    /// Value for cpu.max
    #[must_use]
    pub fn cpu_max(&self) -> String {
        if self.cpu_percent >= 100 {
            format!("max {CPU_PERIOD_US}")
        } else {
            let quota = u64::from(self.cpu_percent) * CPU_PERIOD_US / 100;
            format!("{} {CPU_PERIOD_US}", quota.max(1000))
        }
    }
}

/// A cgroup created for one renderer, removed on drop
///
/// `cgroup.procs` is opened up front so the child can join with a single
/// `write` before exec.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
    procs: File,
    kill_on_close: bool,
}

impl Cgroup {
    /// Create `<parent>/<name>` and write its limits
    pub fn create(parent: &Path, limits: &CgroupLimits, kill_on_close: bool) -> Result<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "renderer-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );

        std::fs::create_dir_all(parent).map_err(|e| sandbox_err(parent, &e))?;
        if let Err(e) = std::fs::write(parent.join("cgroup.subtree_control"), "+memory +pids +cpu") {
            tracing::debug!(parent = %parent.display(), error = %e, "could not enable controllers");
        }

        let path = parent.join(name);
        std::fs::create_dir(&path).map_err(|e| sandbox_err(&path, &e))?;

        let written = write_limit(&path, "memory.max", &limits.memory_max.to_string())
            .and_then(|()| write_limit(&path, "pids.max", &limits.pids_max.to_string()))
            .and_then(|()| write_limit(&path, "cpu.max", &limits.cpu_max()))
            .and_then(|()| {
                OpenOptions::new()
                    .write(true)
                    .open(path.join("cgroup.procs"))
                    .map_err(|e| sandbox_err(&path, &e))
            });

        match written {
            Ok(procs) => {
                tracing::debug!(
                    cgroup = %path.display(),
                    memory = limits.memory_max,
                    cpu = limits.cpu_percent,
                    pids = limits.pids_max,
                    "cgroup created"
                );
                Ok(Self {
                    path,
                    procs,
                    kill_on_close,
                })
            }
            Err(e) => {
                let _ = std::fs::remove_dir(&path);
                Err(e)
            }
        }
    }

    /// Descriptor the child writes `0` to in order to join
    #[must_use]
    pub fn procs_fd(&self) -> RawFd {
        self.procs.as_raw_fd()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current memory charge in bytes
    pub fn memory_current(&self) -> Result<u64> {
        let raw = std::fs::read_to_string(self.path.join("memory.current"))?;
        raw.trim()
            .parse()
            .map_err(|e| RenderwardError::SandboxApplication(format!("memory.current: {e}")))
    }

    /// Whether the kernel OOM-killed anything in this cgroup
    pub fn was_oom_killed(&self) -> Result<bool> {
        let events = std::fs::read_to_string(self.path.join("memory.events"))?;
        Ok(events
            .lines()
            .filter_map(|line| line.strip_prefix("oom_kill "))
            .any(|count| count.trim().parse::<u64>().is_ok_and(|n| n > 0)))
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        if self.kill_on_close {
            let _ = std::fs::write(self.path.join("cgroup.kill"), "1");
        }
        // Killed tasks leave the cgroup asynchronously.
        for _ in 0..20 {
            match std::fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(5)),
            }
        }
        tracing::debug!(cgroup = %self.path.display(), "cgroup left behind");
    }
}

/// Join the cgroup whose `cgroup.procs` is open as `fd`
///
/// Async-signal-safe; called in the child between fork and exec.
pub fn join_from_child(fd: RawFd) -> bool {
    // SAFETY: write(2) on an inherited descriptor with a static buffer.
    unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) == 1 }
}

fn write_limit(dir: &Path, file: &str, value: &str) -> Result<()> {
    std::fs::write(dir.join(file), value)
        .map_err(|e| RenderwardError::SandboxApplication(format!("{file}={value}: {e}")))
}

fn sandbox_err(path: &Path, e: &std::io::Error) -> RenderwardError {
    RenderwardError::SandboxApplication(format!("cgroup {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_follow_policy() {
        let policy = SandboxPolicy::builder()
            .max_memory_mb(256)
            .max_cpu_percent(50)
            .max_active_processes(2)
            .build();
        let limits = CgroupLimits::from_policy(&policy);
        assert_eq!(limits.memory_max, 256 * 1024 * 1024);
        assert_eq!(limits.pids_max, 2 * TASKS_PER_PROCESS);
        assert_eq!(limits.cpu_max(), "50000 100000");
    }

    #[test]
    fn full_cpu_is_unlimited() {
        let limits = CgroupLimits {
            memory_max: 1,
            cpu_percent: 100,
            pids_max: 1,
        };
        assert_eq!(limits.cpu_max(), "max 100000");
    }

    #[test]
    fn unusable_parent_is_a_sandbox_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let limits = CgroupLimits::from_policy(&SandboxPolicy::default());
        let err = Cgroup::create(file.path(), &limits, true).unwrap_err();
        assert!(matches!(err, RenderwardError::SandboxApplication(_)));
    }
}
