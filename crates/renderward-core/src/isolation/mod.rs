//! Sandbox primitives applied to the renderer before it runs
//!
//! Every step is best-effort. A step that cannot be applied is recorded as
//! degraded in the [`SandboxReport`] and logged; only process creation
//! itself is fatal.
//!
//! Linux:
//! - `cgroups` - memory, CPU and task limits with kill-on-close
//! - `landlock` - write access restricted to configured paths
//! - `seccomp` - dynamic-code and kernel-surface syscall filters
//! - `privileges` - capability bounding-set drops
//!
//! Windows:
//! - `job` - job object limits and UI restrictions
//! - `token` - low integrity label and privilege removal
//! - `mitigation` - process mitigation policy bitmask

#[cfg(target_os = "linux")]
pub mod cgroups;
#[cfg(target_os = "linux")]
pub mod landlock;
#[cfg(target_os = "linux")]
pub mod privileges;
#[cfg(target_os = "linux")]
pub mod seccomp;

#[cfg(windows)]
pub mod job;
#[cfg(windows)]
pub mod mitigation;
#[cfg(windows)]
pub mod token;

use crate::config::{DllPolicy, NetworkPolicy, SandboxPolicy};
use serde::Serialize;

/// What was and was not applied to one launched process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SandboxReport {
    pub applied: Vec<&'static str>,
    pub degraded: Vec<(&'static str, String)>,
}

impl SandboxReport {
    pub fn applied(&mut self, step: &'static str) {
        tracing::debug!(step, "sandbox step applied");
        self.applied.push(step);
    }

    pub fn degraded(&mut self, step: &'static str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(step, reason = %reason, "sandbox step degraded");
        self.degraded.push((step, reason));
    }

    #[must_use]
    pub fn is_fully_applied(&self) -> bool {
        self.degraded.is_empty()
    }

    #[must_use]
    pub fn was_applied(&self, step: &str) -> bool {
        self.applied.iter().any(|s| *s == step)
    }

    #[must_use]
    pub fn was_degraded(&self, step: &str) -> bool {
        self.degraded.iter().any(|(s, _)| *s == step)
    }
}

/// Log the network and DLL policy for out-of-band enforcement
///
/// Neither is enforced here; the host's firewall and loader configuration
/// are expected to carry them.
pub fn log_external_policies(policy: &SandboxPolicy) {
    match policy.network_policy {
        NetworkPolicy::FullAccess => {}
        NetworkPolicy::LocalhostOnly => {
            tracing::info!("network policy: restrict renderer to loopback via host firewall");
        }
        NetworkPolicy::Blocked => {
            tracing::info!("network policy: block all renderer traffic via host firewall");
        }
        NetworkPolicy::UserPrompt => {
            tracing::info!(
                allowed_hosts = ?policy.allowed_hosts,
                "network policy: prompt for hosts outside the allow list"
            );
        }
    }

    if policy.dll_policy != DllPolicy::AllowAll {
        tracing::info!(
            policy = ?policy.dll_policy,
            trusted_dir = ?policy.trusted_dll_directory,
            "library load policy is advisory"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_tracks_steps() {
        let mut report = SandboxReport::default();
        assert!(report.is_fully_applied());

        report.applied("job_object");
        report.degraded("control_flow_guard", "not available");

        assert!(report.was_applied("job_object"));
        assert!(report.was_degraded("control_flow_guard"));
        assert!(!report.was_applied("control_flow_guard"));
        assert!(!report.is_fully_applied());
    }
}
