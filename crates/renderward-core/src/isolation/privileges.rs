//! Capability bounding-set reduction
//!
//! The capabilities dropped here cover what a renderer could abuse to
//! debug other processes, load kernel code, bypass file permissions,
//! change identity or adjust the system clock.

use caps::{CapSet, Capability};

/// Capabilities removed from the child's bounding set
pub const DROPPED_CAPABILITIES: &[Capability] = &[
    Capability::CAP_SYS_PTRACE,
    Capability::CAP_SYS_MODULE,
    Capability::CAP_DAC_READ_SEARCH,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_SYS_BOOT,
    Capability::CAP_SETUID,
    Capability::CAP_SETGID,
    Capability::CAP_FOWNER,
    Capability::CAP_CHOWN,
    Capability::CAP_AUDIT_CONTROL,
    Capability::CAP_SYS_TIME,
    Capability::CAP_SYS_NICE,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_RAWIO,
    Capability::CAP_MKNOD,
    Capability::CAP_BPF,
];

/// What the parent can do about capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityPlan {
    /// The parent holds nothing to pass on; no-new-privs is enough
    NothingHeld,
    /// Drop these bounding-set indices in the child
    Drop(Vec<libc::c_ulong>),
    /// Capabilities are held but `CAP_SETPCAP` is missing
    Unable,
}

/// Decide in the parent which indices the child drops
#[must_use]
pub fn plan() -> CapabilityPlan {
    let effective = caps::read(None, CapSet::Effective).unwrap_or_default();
    let permitted = caps::read(None, CapSet::Permitted).unwrap_or_default();
    if effective.is_empty() && permitted.is_empty() {
        return CapabilityPlan::NothingHeld;
    }
    if !effective.contains(&Capability::CAP_SETPCAP) {
        tracing::info!(held = effective.len(), "cannot shrink bounding set without CAP_SETPCAP");
        return CapabilityPlan::Unable;
    }
    let bounding = caps::read(None, CapSet::Bounding).unwrap_or_default();
    CapabilityPlan::Drop(
        DROPPED_CAPABILITIES
            .iter()
            .filter(|cap| bounding.contains(cap))
            .map(|cap| libc::c_ulong::from(cap.index()))
            .collect(),
    )
}

/// Drop each index from the bounding set; async-signal-safe
pub fn drop_from_child(indices: &[libc::c_ulong]) -> bool {
    indices.iter().all(|&index| {
        // SAFETY: prctl with integer arguments only.
        unsafe { libc::prctl(libc::PR_CAPBSET_DROP, index, 0, 0, 0) == 0 }
    })
}

/// Forbid gaining privileges through exec; async-signal-safe
pub fn no_new_privs_from_child() -> bool {
    // SAFETY: prctl with integer arguments only.
    unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setpcap_is_never_dropped() {
        assert!(!DROPPED_CAPABILITIES.contains(&Capability::CAP_SETPCAP));
    }

    #[test]
    fn plan_matches_held_capabilities() {
        let effective = caps::read(None, CapSet::Effective).unwrap_or_default();
        match plan() {
            CapabilityPlan::NothingHeld => assert!(effective.is_empty()),
            CapabilityPlan::Unable => assert!(!effective.contains(&Capability::CAP_SETPCAP)),
            CapabilityPlan::Drop(indices) => {
                assert!(effective.contains(&Capability::CAP_SETPCAP));
                assert!(indices.len() <= DROPPED_CAPABILITIES.len());
            }
        }
    }
}
