//! Windows process creation
//!
//! The child is created suspended with its mitigation policy attached, put
//! in a job object, given a hardened token and only then resumed.

use crate::config::{LaunchConfig, SandboxPolicy};
use crate::isolation::SandboxReport;
use crate::isolation::job::JobObject;
use crate::isolation::mitigation::{self, MitigationAttribute};
use crate::isolation::token::ProcessToken;
use crate::os::windows::{OwnedHandle, wait_handle};
use crate::process::TERMINATED_EXIT_CODE;
use crate::{RenderwardError, Result};
use parking_lot::Mutex;
use std::os::windows::ffi::OsStrExt;
use std::time::{Duration, Instant};
use windows::Win32::Foundation::{BOOL, STILL_ACTIVE};
use windows::Win32::System::ProcessStatus::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use windows::Win32::System::Threading::{
    CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW, CREATE_SUSPENDED, CreateProcessW,
    EXTENDED_STARTUPINFO_PRESENT, GetExitCodeProcess, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, ResumeThread, STARTUPINFOEXW, SuspendThread,
    TerminateProcess,
};
use windows::core::{PCWSTR, PWSTR};

/// A running (or exited, not yet dropped) renderer
///
/// Fields drop in declaration order: thread, process, then job.
pub struct ChildProcess {
    thread: OwnedHandle,
    process: OwnedHandle,
    job: Option<JobObject>,
    pid: u32,
    started_at: Instant,
    exit_code: Mutex<Option<i32>>,
}

impl ChildProcess {
    pub(super) fn spawn(config: &LaunchConfig, report: &mut SandboxReport) -> Result<Self> {
        let policy = &config.sandbox;
        let bits = mitigation::policy_bits(policy);

        let info = match create_suspended(config, bits) {
            Ok(info) => {
                for step in mitigation::step_names(bits) {
                    report.applied(step);
                }
                info
            }
            Err(e) if bits != 0 => {
                for step in mitigation::step_names(bits) {
                    report.degraded(step, format!("mitigation attribute rejected: {e}"));
                }
                create_suspended(config, 0)?
            }
            Err(e) => return Err(e),
        };

        // SAFETY: both handles were just returned by CreateProcessW.
        let mut child = Self {
            thread: unsafe { OwnedHandle::from_raw(info.hThread) },
            process: unsafe { OwnedHandle::from_raw(info.hProcess) },
            job: None,
            pid: info.dwProcessId,
            started_at: Instant::now(),
            exit_code: Mutex::new(None),
        };

        child.job = apply_job(policy, &child.process, report);
        apply_token(policy, &child.process, report);
        if policy.restricted_sids {
            report.degraded(
                "restricted_sids",
                "restricted tokens cannot be attached to an existing process",
            );
        }

        // SAFETY: our own suspended primary thread.
        if unsafe { ResumeThread(child.thread.raw()) } == u32::MAX {
            let error = windows::core::Error::from_win32();
            let _ = child.kill();
            return Err(RenderwardError::ProcessCreation(format!("ResumeThread: {error}")));
        }
        child.started_at = Instant::now();
        Ok(child)
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        matches!(self.wait_exit(Duration::ZERO), Ok(None))
    }

    /// Wait up to `timeout` for the process to exit
    pub fn wait_exit(&self, timeout: Duration) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code() {
            return Ok(Some(code));
        }
        if !wait_handle(self.process.raw(), timeout)? {
            return Ok(None);
        }
        let mut code = 0u32;
        // SAFETY: owned process handle.
        unsafe { GetExitCodeProcess(self.process.raw(), &mut code) }?;
        if code == STILL_ACTIVE.0 as u32 {
            return Ok(None);
        }
        #[allow(clippy::cast_possible_wrap)]
        let code = code as i32;
        *self.exit_code.lock() = Some(code);
        Ok(Some(code))
    }

    pub fn kill(&self) -> Result<()> {
        if self.exit_code().is_some() {
            return Ok(());
        }
        // SAFETY: owned process handle.
        unsafe { TerminateProcess(self.process.raw(), TERMINATED_EXIT_CODE as u32) }?;
        Ok(())
    }

    /// Suspend the primary thread
    pub fn suspend(&self) -> Result<()> {
        // SAFETY: owned thread handle.
        if unsafe { SuspendThread(self.thread.raw()) } == u32::MAX {
            return Err(windows::core::Error::from_win32().into());
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        // SAFETY: owned thread handle.
        if unsafe { ResumeThread(self.thread.raw()) } == u32::MAX {
            return Err(windows::core::Error::from_win32().into());
        }
        Ok(())
    }

    #[must_use]
    pub fn memory_bytes(&self) -> Option<u64> {
        let mut counters = PROCESS_MEMORY_COUNTERS::default();
        // SAFETY: counters is sized as declared.
        unsafe {
            GetProcessMemoryInfo(
                self.process.raw(),
                &mut counters,
                std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32,
            )
        }
        .ok()
        .map(|()| counters.WorkingSetSize as u64)
    }

    #[must_use]
    pub const fn was_oom_killed(&self) -> bool {
        false
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.exit_code().is_none() {
            let _ = self.kill();
        }
    }
}

fn create_suspended(config: &LaunchConfig, bits: u64) -> Result<PROCESS_INFORMATION> {
    let mut command_line = wide_command_line(config);
    let working_dir: Option<Vec<u16>> = config
        .working_dir
        .clone()
        .or_else(|| config.executable.parent().map(std::path::Path::to_path_buf))
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.as_os_str().encode_wide().chain(Some(0)).collect());

    let mut flags: PROCESS_CREATION_FLAGS = CREATE_SUSPENDED | CREATE_NEW_PROCESS_GROUP;
    if config.hide_console {
        flags |= CREATE_NO_WINDOW;
    }

    let mut attribute = if bits == 0 {
        None
    } else {
        flags |= EXTENDED_STARTUPINFO_PRESENT;
        Some(MitigationAttribute::new(bits)?)
    };

    let mut startup = STARTUPINFOEXW::default();
    startup.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
    startup.lpAttributeList = attribute
        .as_mut()
        .map_or(LPPROC_THREAD_ATTRIBUTE_LIST::default(), MitigationAttribute::list);

    let mut info = PROCESS_INFORMATION::default();
    // SAFETY: every buffer outlives the call; the command line is mutable
    // as CreateProcessW requires.
    unsafe {
        CreateProcessW(
            PCWSTR::null(),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            BOOL::from(config.inherit_handles),
            flags,
            None,
            working_dir
                .as_ref()
                .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
            &startup.StartupInfo,
            &mut info,
        )
    }
    .map_err(|e| {
        RenderwardError::ProcessCreation(format!("{}: {e}", config.executable.display()))
    })?;
    Ok(info)
}

fn apply_job(
    policy: &SandboxPolicy,
    process: &OwnedHandle,
    report: &mut SandboxReport,
) -> Option<JobObject> {
    if !policy.job_object {
        return None;
    }
    let job = match JobObject::create(policy).and_then(|job| {
        job.assign(process.raw())?;
        Ok(job)
    }) {
        Ok(job) => job,
        Err(e) => {
            report.degraded("job_object", e.to_string());
            return None;
        }
    };
    report.applied("job_object");

    match job.limit_cpu(policy.max_cpu_percent) {
        Ok(()) => report.applied("cpu_limit"),
        Err(e) => report.degraded("cpu_limit", e.to_string()),
    }
    if policy.restrict_ui_access {
        match job.restrict_ui() {
            Ok(()) => report.applied("ui_restrictions"),
            Err(e) => report.degraded("ui_restrictions", e.to_string()),
        }
    }
    Some(job)
}

fn apply_token(policy: &SandboxPolicy, process: &OwnedHandle, report: &mut SandboxReport) {
    if !policy.low_integrity && !policy.reduce_privileges {
        return;
    }
    let token = match ProcessToken::open(process.raw()) {
        Ok(token) => token,
        Err(e) => {
            if policy.low_integrity {
                report.degraded("low_integrity", e.to_string());
            }
            if policy.reduce_privileges {
                report.degraded("privileges", e.to_string());
            }
            return;
        }
    };
    if policy.low_integrity {
        match token.set_low_integrity() {
            Ok(()) => report.applied("low_integrity"),
            Err(e) => report.degraded("low_integrity", e.to_string()),
        }
    }
    if policy.reduce_privileges {
        match token.remove_privileges() {
            Ok(removed) => {
                tracing::debug!(removed, "token privileges removed");
                report.applied("privileges");
            }
            Err(e) => report.degraded("privileges", e.to_string()),
        }
    }
}

/// Quote arguments the way the MSVC runtime splits them
fn quote_arg(arg: &str, out: &mut String) {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '"']) {
        out.push_str(arg);
        return;
    }
    out.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

fn wide_command_line(config: &LaunchConfig) -> Vec<u16> {
    let mut line = String::new();
    quote_arg(&config.executable.to_string_lossy(), &mut line);
    for arg in config.command_line() {
        line.push(' ');
        quote_arg(&arg, &mut line);
    }
    line.encode_utf16().chain(Some(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quoted(arg: &str) -> String {
        let mut out = String::new();
        quote_arg(arg, &mut out);
        out
    }

    #[test]
    fn quoting_follows_runtime_rules() {
        assert_eq!(quoted("plain"), "plain");
        assert_eq!(quoted("two words"), "\"two words\"");
        assert_eq!(quoted(""), "\"\"");
        assert_eq!(quoted(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quoted(r"C:\dir with space\"), r#""C:\dir with space\\""#);
    }
}
