//! Process mitigation policy passed at creation time

use crate::config::SandboxPolicy;
use crate::{RenderwardError, Result};
use std::ffi::c_void;
use windows::Win32::System::Threading::{
    DeleteProcThreadAttributeList, InitializeProcThreadAttributeList, LPPROC_THREAD_ATTRIBUTE_LIST,
    UpdateProcThreadAttribute,
};

const PROC_THREAD_ATTRIBUTE_MITIGATION_POLICY: usize = 0x0002_0007;

const DEP_ENABLE: u64 = 0x01;
const FORCE_RELOCATE_IMAGES: u64 = 1 << 8;
const HEAP_TERMINATE: u64 = 1 << 12;
const BOTTOM_UP_ASLR: u64 = 1 << 16;
const HIGH_ENTROPY_ASLR: u64 = 1 << 20;
const STRICT_HANDLE_CHECKS: u64 = 1 << 24;
const WIN32K_SYSTEM_CALL_DISABLE: u64 = 1 << 28;
const EXTENSION_POINT_DISABLE: u64 = 1 << 32;
const PROHIBIT_DYNAMIC_CODE: u64 = 1 << 36;
const CONTROL_FLOW_GUARD: u64 = 1 << 40;
const BLOCK_NON_MICROSOFT_BINARIES: u64 = 1 << 44;
const FONT_DISABLE: u64 = 0x3 << 48;

/// Mitigation bits for `policy`; zero when mitigations are off
#[must_use]
pub fn policy_bits(policy: &SandboxPolicy) -> u64 {
    if !policy.mitigations {
        return 0;
    }
    let mut bits = HEAP_TERMINATE | STRICT_HANDLE_CHECKS;
    if policy.dep {
        bits |= DEP_ENABLE;
    }
    if policy.aslr {
        bits |= FORCE_RELOCATE_IMAGES | BOTTOM_UP_ASLR | HIGH_ENTROPY_ASLR;
    }
    if policy.control_flow_guard {
        bits |= CONTROL_FLOW_GUARD;
    }
    if policy.prohibit_dynamic_code {
        bits |= PROHIBIT_DYNAMIC_CODE;
    }
    if policy.win32k_lockdown {
        bits |= WIN32K_SYSTEM_CALL_DISABLE | FONT_DISABLE;
    }
    if policy.enforce_code_signing {
        bits |= BLOCK_NON_MICROSOFT_BINARIES;
    }
    if policy.disable_extension_points {
        bits |= EXTENSION_POINT_DISABLE;
    }
    bits
}

/// Names of the steps a bitmask covers, for the sandbox report
#[must_use]
pub fn step_names(bits: u64) -> Vec<&'static str> {
    [
        (DEP_ENABLE, "dep"),
        (BOTTOM_UP_ASLR, "aslr"),
        (CONTROL_FLOW_GUARD, "control_flow_guard"),
        (PROHIBIT_DYNAMIC_CODE, "prohibit_dynamic_code"),
        (WIN32K_SYSTEM_CALL_DISABLE, "win32k_lockdown"),
        (BLOCK_NON_MICROSOFT_BINARIES, "code_signing"),
        (EXTENSION_POINT_DISABLE, "extension_points"),
    ]
    .into_iter()
    .filter(|(bit, _)| bits & bit != 0)
    .map(|(_, name)| name)
    .collect()
}

/// A one-entry attribute list carrying the mitigation bitmask
///
/// The bitmask is boxed so its address stays fixed while the list points
/// at it.
pub struct MitigationAttribute {
    buffer: Vec<u8>,
    _bits: Box<u64>,
}

impl MitigationAttribute {
    pub fn new(bits: u64) -> Result<Self> {
        let mut size = 0usize;
        // SAFETY: size query; the expected insufficient-buffer error is ignored.
        let _ = unsafe { InitializeProcThreadAttributeList(LPPROC_THREAD_ATTRIBUTE_LIST::default(), 1, 0, &mut size) };
        let mut buffer = vec![0u8; size];
        let list = LPPROC_THREAD_ATTRIBUTE_LIST(buffer.as_mut_ptr().cast());
        // SAFETY: buffer has the size the query reported.
        unsafe { InitializeProcThreadAttributeList(list, 1, 0, &mut size) }
            .map_err(|e| RenderwardError::SandboxApplication(format!("attribute list: {e}")))?;

        let bits = Box::new(bits);
        // SAFETY: list is initialized; bits outlives the list (same struct).
        let updated = unsafe {
            UpdateProcThreadAttribute(
                list,
                0,
                PROC_THREAD_ATTRIBUTE_MITIGATION_POLICY,
                Some(std::ptr::from_ref::<u64>(&bits).cast::<c_void>()),
                std::mem::size_of::<u64>(),
                None,
                None,
            )
        };
        if let Err(e) = updated {
            // SAFETY: initialized above and not yet deleted.
            unsafe { DeleteProcThreadAttributeList(list) };
            return Err(RenderwardError::SandboxApplication(format!("mitigation attribute: {e}")));
        }
        Ok(Self { buffer, _bits: bits })
    }

    #[must_use]
    pub fn list(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr().cast())
    }
}

impl Drop for MitigationAttribute {
    fn drop(&mut self) {
        // SAFETY: the list was initialized in `new` and is deleted once.
        unsafe { DeleteProcThreadAttributeList(self.list()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mitigations_off_means_no_bits() {
        assert_eq!(policy_bits(&SandboxPolicy::permissive()), 0);
    }

    #[test]
    fn default_policy_bits() {
        let bits = policy_bits(&SandboxPolicy::default());
        assert_ne!(bits & DEP_ENABLE, 0);
        assert_ne!(bits & CONTROL_FLOW_GUARD, 0);
        assert_eq!(bits & PROHIBIT_DYNAMIC_CODE, 0);
        assert_eq!(
            step_names(bits),
            vec!["dep", "aslr", "control_flow_guard", "extension_points"]
        );
    }
}
