//! Seccomp-BPF syscall filtering
//!
//! Two deny lists, both returning `EPERM` and allowing everything else:
//! - dynamic code: executable `mprotect` and anonymous executable `mmap`
//! - kernel surface: debugging, module loading, mounts and similar calls a
//!   renderer never needs

use crate::{RenderwardError, Result};
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use std::collections::BTreeMap;

/// Which deny lists to compile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompConfig {
    pub deny_dynamic_code: bool,
    pub deny_kernel_surface: bool,
}

impl SeccompConfig {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.deny_dynamic_code && !self.deny_kernel_surface
    }

    /// Compile the filter in the parent; the child only installs it
    pub fn compile(&self) -> Result<BpfProgram> {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

        if self.deny_dynamic_code {
            let exec_prot = arg_has_bits(2, libc::PROT_EXEC)?;
            rules.insert(libc::SYS_mprotect, vec![rule(vec![exec_prot.clone()])?]);
            rules.insert(libc::SYS_pkey_mprotect, vec![rule(vec![exec_prot.clone()])?]);
            rules.insert(
                libc::SYS_mmap,
                vec![rule(vec![exec_prot, arg_has_bits(3, libc::MAP_ANONYMOUS)?])?],
            );
        }

        if self.deny_kernel_surface {
            for syscall in kernel_surface_syscalls() {
                // An empty rule list matches the syscall unconditionally.
                rules.entry(syscall).or_default();
            }
        }

        let arch = TargetArch::try_from(std::env::consts::ARCH).map_err(seccomp_err)?;
        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(libc::EPERM as u32),
            arch,
        )
        .map_err(seccomp_err)?;
        let program: BpfProgram = filter.try_into().map_err(seccomp_err)?;

        tracing::debug!(
            dynamic_code = self.deny_dynamic_code,
            kernel_surface = self.deny_kernel_surface,
            instructions = program.len(),
            "seccomp filter compiled"
        );
        Ok(program)
    }
}

/// Install a compiled filter on the calling thread
///
/// Only issues prctl and seccomp syscalls, so it is usable between fork and
/// exec.
pub fn install_from_child(program: &BpfProgram) -> bool {
    seccompiler::apply_filter(program).is_ok()
}

fn arg_has_bits(index: u8, bits: libc::c_int) -> Result<SeccompCondition> {
    let bits = bits as u64;
    SeccompCondition::new(index, SeccompCmpArgLen::Dword, SeccompCmpOp::MaskedEq(bits), bits)
        .map_err(seccomp_err)
}

fn rule(conditions: Vec<SeccompCondition>) -> Result<SeccompRule> {
    SeccompRule::new(conditions).map_err(seccomp_err)
}

fn seccomp_err(e: impl std::fmt::Display) -> RenderwardError {
    RenderwardError::SandboxApplication(format!("seccomp: {e}"))
}

/// Syscalls outside what a renderer touches
fn kernel_surface_syscalls() -> Vec<i64> {
    vec![
        libc::SYS_ptrace,
        libc::SYS_process_vm_readv,
        libc::SYS_process_vm_writev,
        libc::SYS_kexec_load,
        libc::SYS_init_module,
        libc::SYS_finit_module,
        libc::SYS_delete_module,
        libc::SYS_bpf,
        libc::SYS_perf_event_open,
        libc::SYS_userfaultfd,
        libc::SYS_mount,
        libc::SYS_umount2,
        libc::SYS_pivot_root,
        libc::SYS_swapon,
        libc::SYS_swapoff,
        libc::SYS_reboot,
        libc::SYS_settimeofday,
        libc::SYS_clock_settime,
        libc::SYS_keyctl,
        libc::SYS_add_key,
        libc::SYS_request_key,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_compiles_to_allow_all() {
        let config = SeccompConfig::default();
        assert!(config.is_empty());
        assert!(!config.compile().unwrap().is_empty());
    }

    #[test]
    fn each_list_adds_instructions() {
        let base = SeccompConfig::default().compile().unwrap().len();
        let dynamic = SeccompConfig {
            deny_dynamic_code: true,
            ..SeccompConfig::default()
        }
        .compile()
        .unwrap()
        .len();
        let both = SeccompConfig {
            deny_dynamic_code: true,
            deny_kernel_surface: true,
        }
        .compile()
        .unwrap()
        .len();
        assert!(dynamic > base);
        assert!(both > dynamic);
    }

    #[test]
    fn kernel_surface_list_has_no_duplicates() {
        let mut list = kernel_surface_syscalls();
        let len = list.len();
        list.sort_unstable();
        list.dedup();
        assert_eq!(list.len(), len);
    }
}
