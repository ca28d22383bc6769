//! Job object limits

use crate::config::SandboxPolicy;
use crate::os::windows::OwnedHandle;
use crate::{RenderwardError, Result};
use std::ffi::c_void;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_CPU_RATE_CONTROL_ENABLE,
    JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP, JOB_OBJECT_LIMIT_ACTIVE_PROCESS,
    JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION, JOB_OBJECT_LIMIT_JOB_MEMORY,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOB_OBJECT_LIMIT_PROCESS_MEMORY,
    JOB_OBJECT_UILIMIT_DESKTOP, JOB_OBJECT_UILIMIT_DISPLAYSETTINGS, JOB_OBJECT_UILIMIT_EXITWINDOWS,
    JOB_OBJECT_UILIMIT_GLOBALATOMS, JOB_OBJECT_UILIMIT_HANDLES,
    JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS, JOBOBJECT_BASIC_UI_RESTRICTIONS,
    JOBOBJECT_CPU_RATE_CONTROL_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JobObjectBasicUIRestrictions, JobObjectCpuRateControlInformation,
    JobObjectExtendedLimitInformation, SetInformationJobObject, TerminateJobObject,
};
use windows::core::PCWSTR;

/// Job object holding the renderer; closing it kills the renderer when
/// kill-on-close is set
pub struct JobObject(OwnedHandle);

impl JobObject {
    /// Create a job with the memory, process and kill-on-close limits
    pub fn create(policy: &SandboxPolicy) -> Result<Self> {
        // SAFETY: anonymous job object, default security.
        let handle = unsafe { CreateJobObjectW(None, PCWSTR::null()) }
            .map_err(|e| RenderwardError::SandboxApplication(format!("CreateJobObject: {e}")))?;
        // SAFETY: handle was just returned to us.
        let job = Self(unsafe { OwnedHandle::from_raw(handle) });

        let memory = usize::try_from(policy.max_memory_mb.saturating_mul(1024 * 1024))
            .unwrap_or(usize::MAX);
        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_PROCESS_MEMORY
            | JOB_OBJECT_LIMIT_JOB_MEMORY
            | JOB_OBJECT_LIMIT_ACTIVE_PROCESS
            | JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION;
        if policy.kill_on_job_close {
            info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        }
        info.BasicLimitInformation.ActiveProcessLimit = policy.max_active_processes;
        info.ProcessMemoryLimit = memory;
        info.JobMemoryLimit = memory;
        job.set(JobObjectExtendedLimitInformation, &info)?;

        tracing::debug!(
            memory_mb = policy.max_memory_mb,
            processes = policy.max_active_processes,
            kill_on_close = policy.kill_on_job_close,
            "job object created"
        );
        Ok(job)
    }

    /// Hard-cap CPU use at `percent` of the machine
    pub fn limit_cpu(&self, percent: u32) -> Result<()> {
        let mut info = JOBOBJECT_CPU_RATE_CONTROL_INFORMATION {
            ControlFlags: JOB_OBJECT_CPU_RATE_CONTROL_ENABLE | JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP,
            ..Default::default()
        };
        // CpuRate is in hundredths of a percent.
        info.Anonymous.CpuRate = percent.clamp(1, 100) * 100;
        self.set(JobObjectCpuRateControlInformation, &info)
    }

    /// Deny access to user handles, desktops, display settings and shutdown
    pub fn restrict_ui(&self) -> Result<()> {
        let info = JOBOBJECT_BASIC_UI_RESTRICTIONS {
            UIRestrictionsClass: JOB_OBJECT_UILIMIT_HANDLES
                | JOB_OBJECT_UILIMIT_DESKTOP
                | JOB_OBJECT_UILIMIT_DISPLAYSETTINGS
                | JOB_OBJECT_UILIMIT_EXITWINDOWS
                | JOB_OBJECT_UILIMIT_GLOBALATOMS
                | JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS,
        };
        self.set(JobObjectBasicUIRestrictions, &info)
    }

    pub fn assign(&self, process: HANDLE) -> Result<()> {
        // SAFETY: both handles are live for the duration of the call.
        unsafe { AssignProcessToJobObject(self.0.raw(), process) }
            .map_err(|e| RenderwardError::SandboxApplication(format!("AssignProcessToJobObject: {e}")))
    }

    pub fn terminate(&self, exit_code: u32) -> Result<()> {
        // SAFETY: owned job handle.
        unsafe { TerminateJobObject(self.0.raw(), exit_code) }?;
        Ok(())
    }

    fn set<T>(
        &self,
        class: windows::Win32::System::JobObjects::JOBOBJECTINFOCLASS,
        info: &T,
    ) -> Result<()> {
        // SAFETY: `info` is the structure matching `class` and outlives the call.
        unsafe {
            SetInformationJobObject(
                self.0.raw(),
                class,
                std::ptr::from_ref(info).cast::<c_void>(),
                u32::try_from(std::mem::size_of::<T>()).unwrap_or(u32::MAX),
            )
        }
        .map_err(|e| RenderwardError::SandboxApplication(format!("SetInformationJobObject: {e}")))
    }
}
