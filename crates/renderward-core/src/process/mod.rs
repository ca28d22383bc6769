//! Sandboxed renderer processes
//!
//! [`spawn_sandboxed`] creates the child with every applicable step of its
//! [`SandboxPolicy`](crate::SandboxPolicy) in place before the child image
//! runs. The returned [`ChildProcess`] is the only owner of the process and
//! its kernel objects.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::ChildProcess;
#[cfg(windows)]
pub use self::windows::ChildProcess;

use crate::config::LaunchConfig;
use crate::isolation::{self, SandboxReport};
use crate::{RenderwardError, Result};
use serde::Serialize;
use std::time::Duration;

/// Exit code recorded for a process the supervisor killed
pub const TERMINATED_EXIT_CODE: i32 = 1;

/// Snapshot of a supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub uptime: Duration,
    pub restart_count: u32,
    pub crashed: bool,
    pub exit_code: Option<i32>,
    /// Bytes charged to the process's job or cgroup, when known
    pub memory_bytes: Option<u64>,
}

/// Launch `config.executable` under `config.sandbox`
///
/// Fails only when the process itself cannot be created; sandbox steps that
/// cannot be applied are listed in the report.
pub fn spawn_sandboxed(config: &LaunchConfig) -> Result<(ChildProcess, SandboxReport)> {
    config.sandbox.validate()?;
    if config.executable.as_os_str().is_empty() {
        return Err(RenderwardError::ProcessCreation("no executable configured".into()));
    }

    isolation::log_external_policies(&config.sandbox);

    let mut report = SandboxReport::default();
    let child = ChildProcess::spawn(config, &mut report)?;

    tracing::info!(
        pid = child.pid(),
        executable = %config.executable.display(),
        applied = report.applied.len(),
        degraded = report.degraded.len(),
        "renderer process started"
    );
    Ok((child, report))
}
