//! Landlock write restriction
//!
//! Stands in for a low integrity level: the child keeps read access to the
//! whole filesystem but may only write beneath the configured paths.

use crate::{RenderwardError, Result};
use landlock::{
    ABI, AccessFs, Ruleset, RulesetAttr, RulesetCreated, RulesetCreatedAttr,
    path_beneath_rules,
};
use std::path::{Path, PathBuf};

const TARGET_ABI: ABI = ABI::V2;

/// Paths a low-integrity child may write beneath
#[derive(Debug, Clone, Default)]
pub struct LandlockConfig {
    pub rw_paths: Vec<PathBuf>,
}

impl LandlockConfig {
    /// Writable set for a renderer: the configured paths plus the
    /// directories backing shared memory and `/dev/null`
    #[must_use]
    pub fn for_renderer(writable: &[PathBuf]) -> Self {
        let mut config = Self::default();
        for path in writable {
            config = config.rw(path);
        }
        config.rw("/dev/shm").rw("/dev/null")
    }

    /// Add a read-write path
    #[must_use]
    pub fn rw(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        if !self.rw_paths.contains(&path) {
            self.rw_paths.push(path);
        }
        self
    }

    /// Build the ruleset in the parent; the child only has to enforce it
    ///
    /// Paths that do not exist are skipped.
    pub fn prepare(&self) -> Result<RulesetCreated> {
        let write = AccessFs::from_write(TARGET_ABI);
        let ruleset = Ruleset::default()
            .handle_access(write)
            .and_then(Ruleset::create)
            .and_then(|created| created.add_rules(path_beneath_rules(&self.rw_paths, write)))
            .map_err(|e| RenderwardError::SandboxApplication(format!("landlock: {e}")))?;

        tracing::debug!(rw = self.rw_paths.len(), "landlock ruleset prepared");
        Ok(ruleset)
    }
}

/// Enforce a prepared ruleset on the calling process
///
/// Only issues the landlock and prctl syscalls, so it is usable between
/// fork and exec. Returns false when the kernel did not enforce it.
pub fn restrict_from_child(ruleset: RulesetCreated) -> bool {
    ruleset
        .restrict_self()
        .is_ok_and(|status| status.ruleset != landlock::RulesetStatus::NotEnforced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renderer_set_includes_shared_memory() {
        let config = LandlockConfig::for_renderer(&[PathBuf::from("/tmp"), PathBuf::from("/tmp")]);
        assert_eq!(
            config.rw_paths,
            vec![
                PathBuf::from("/tmp"),
                PathBuf::from("/dev/shm"),
                PathBuf::from("/dev/null")
            ]
        );
    }
}
