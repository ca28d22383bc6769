//! Primary token hardening for a suspended child

use crate::os::windows::OwnedHandle;
use crate::{RenderwardError, Result};
use std::ffi::c_void;
use windows::Win32::Foundation::{ERROR_NOT_ALL_ASSIGNED, GetLastError, HANDLE, LUID};
use windows::Win32::Security::{
    AdjustTokenPrivileges, CreateWellKnownSid, GetLengthSid, LUID_AND_ATTRIBUTES,
    LookupPrivilegeValueW, PSID, SE_GROUP_INTEGRITY, SE_PRIVILEGE_REMOVED, SID_AND_ATTRIBUTES,
    SetTokenInformation, TOKEN_ADJUST_DEFAULT, TOKEN_ADJUST_PRIVILEGES, TOKEN_MANDATORY_LABEL,
    TOKEN_PRIVILEGES, TOKEN_QUERY, TokenIntegrityLevel, WinLowLabelSid,
};
use windows::Win32::System::Threading::OpenProcessToken;
use windows::core::{PCWSTR, w};

/// Privileges removed from the renderer's token
pub const REMOVED_PRIVILEGES: &[PCWSTR] = &[
    w!("SeDebugPrivilege"),
    w!("SeLoadDriverPrivilege"),
    w!("SeBackupPrivilege"),
    w!("SeRestorePrivilege"),
    w!("SeShutdownPrivilege"),
    w!("SeImpersonatePrivilege"),
    w!("SeTakeOwnershipPrivilege"),
    w!("SeSecurityPrivilege"),
    w!("SeSystemtimePrivilege"),
    w!("SeIncreaseBasePriorityPrivilege"),
    w!("SeTcbPrivilege"),
    w!("SeCreateTokenPrivilege"),
];

const SID_BUFFER: usize = 68;

/// The child's primary token, opened for adjustment
pub struct ProcessToken(OwnedHandle);

impl ProcessToken {
    pub fn open(process: HANDLE) -> Result<Self> {
        let mut token = HANDLE::default();
        // SAFETY: process is a live handle we own; token receives a new handle.
        unsafe {
            OpenProcessToken(
                process,
                TOKEN_ADJUST_DEFAULT | TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
                &mut token,
            )
        }
        .map_err(|e| RenderwardError::SandboxApplication(format!("OpenProcessToken: {e}")))?;
        // SAFETY: token was just returned to us.
        Ok(Self(unsafe { OwnedHandle::from_raw(token) }))
    }

    /// Set the mandatory label to Low (S-1-16-4096)
    pub fn set_low_integrity(&self) -> Result<()> {
        let mut sid = [0u8; SID_BUFFER];
        let mut size = SID_BUFFER as u32;
        let psid = PSID(sid.as_mut_ptr().cast());
        // SAFETY: psid points at a buffer of `size` bytes.
        unsafe { CreateWellKnownSid(WinLowLabelSid, PSID::default(), psid, &mut size) }
            .map_err(|e| RenderwardError::SandboxApplication(format!("low label sid: {e}")))?;

        let label = TOKEN_MANDATORY_LABEL {
            Label: SID_AND_ATTRIBUTES {
                Sid: psid,
                Attributes: SE_GROUP_INTEGRITY as u32,
            },
        };
        // SAFETY: psid is a valid SID written above.
        let length = std::mem::size_of::<TOKEN_MANDATORY_LABEL>() as u32 + unsafe { GetLengthSid(psid) };
        // SAFETY: label and the SID it points at live until the call returns.
        unsafe {
            SetTokenInformation(
                self.0.raw(),
                TokenIntegrityLevel,
                std::ptr::from_ref(&label).cast::<c_void>(),
                length,
            )
        }
        .map_err(|e| RenderwardError::SandboxApplication(format!("integrity level: {e}")))
    }

    /// Remove each privilege in [`REMOVED_PRIVILEGES`]; returns how many
    /// the token actually held
    pub fn remove_privileges(&self) -> Result<usize> {
        let mut removed = 0;
        for &name in REMOVED_PRIVILEGES {
            let mut luid = LUID::default();
            // SAFETY: name is a static wide string.
            if unsafe { LookupPrivilegeValueW(PCWSTR::null(), name, &mut luid) }.is_err() {
                continue;
            }
            let privileges = TOKEN_PRIVILEGES {
                PrivilegeCount: 1,
                Privileges: [LUID_AND_ATTRIBUTES {
                    Luid: luid,
                    Attributes: SE_PRIVILEGE_REMOVED,
                }],
            };
            // SAFETY: privileges is a valid single-entry array.
            unsafe { AdjustTokenPrivileges(self.0.raw(), false, Some(&privileges), 0, None, None) }
                .map_err(|e| RenderwardError::SandboxApplication(format!("AdjustTokenPrivileges: {e}")))?;
            // SAFETY: read right after the call that set it.
            if unsafe { GetLastError() } != ERROR_NOT_ALL_ASSIGNED {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
