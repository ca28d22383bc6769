//! Linux process creation
//!
//! Everything that needs allocation, file lookups or filter compilation is
//! prepared in the parent. The `pre_exec` hook then runs only raw syscalls:
//! join the cgroup, drop capabilities, re-enable ASLR, enforce Landlock, set
//! no-new-privs, install seccomp. The hook reports which of those failed
//! through a close-on-exec status pipe.

use crate::config::{LaunchConfig, SandboxPolicy};
use crate::isolation::SandboxReport;
use crate::isolation::cgroups::{self, Cgroup, CgroupLimits};
use crate::isolation::landlock::{self as ll, LandlockConfig};
use crate::isolation::privileges::{self, CapabilityPlan};
use crate::isolation::seccomp::{self, SeccompConfig};
use crate::{RenderwardError, Result};
use ::landlock::RulesetCreated;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use seccompiler::BpfProgram;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const ADDR_NO_RANDOMIZE: libc::c_int = 0x0040000;
const EXIT_POLL: Duration = Duration::from_millis(10);

const STEP_CGROUP: u32 = 1;
const STEP_CAPS: u32 = 1 << 1;
const STEP_ASLR: u32 = 1 << 2;
const STEP_LANDLOCK: u32 = 1 << 3;
const STEP_NO_NEW_PRIVS: u32 = 1 << 4;
const STEP_SECCOMP: u32 = 1 << 5;

const PRELOAD_VARS: &[&str] = &["LD_PRELOAD", "LD_AUDIT", "LD_LIBRARY_PATH"];
const DISPLAY_VARS: &[&str] = &["DISPLAY", "WAYLAND_DISPLAY"];

/// Steps run in the child between fork and exec
struct ChildSteps {
    cgroup_fd: Option<RawFd>,
    capabilities: Vec<libc::c_ulong>,
    enable_aslr: bool,
    ruleset: Mutex<Option<RulesetCreated>>,
    no_new_privs: bool,
    seccomp: Option<BpfProgram>,
    status_fd: RawFd,
}

impl ChildSteps {
    /// Async-signal-safe: no allocation, no locks another thread could hold
    fn run(&self) {
        let mut failed = 0u32;

        if let Some(fd) = self.cgroup_fd {
            if !cgroups::join_from_child(fd) {
                failed |= STEP_CGROUP;
            }
        }
        if !self.capabilities.is_empty() && !privileges::drop_from_child(&self.capabilities) {
            failed |= STEP_CAPS;
        }
        if self.enable_aslr && !clear_no_randomize() {
            failed |= STEP_ASLR;
        }
        if let Some(ruleset) = self.ruleset.lock().take() {
            if !ll::restrict_from_child(ruleset) {
                failed |= STEP_LANDLOCK;
            }
        }
        if self.no_new_privs && !privileges::no_new_privs_from_child() {
            failed |= STEP_NO_NEW_PRIVS;
        }
        if let Some(program) = &self.seccomp {
            if !seccomp::install_from_child(program) {
                failed |= STEP_SECCOMP;
            }
        }

        let bytes = failed.to_ne_bytes();
        // SAFETY: write(2) of a stack buffer to the inherited status pipe.
        unsafe {
            libc::write(self.status_fd, bytes.as_ptr().cast(), bytes.len());
        }
    }
}

fn clear_no_randomize() -> bool {
    // SAFETY: personality(2) with integer arguments; 0xffffffff queries.
    unsafe {
        let current = libc::personality(0xffff_ffff);
        if current == -1 {
            return false;
        }
        current & ADDR_NO_RANDOMIZE == 0
            || libc::personality((current & !ADDR_NO_RANDOMIZE) as libc::c_ulong) != -1
    }
}

/// Create a close-on-exec pipe (returns read end, write end)
fn create_pipe() -> Result<(File, File)> {
    let mut fds = [0i32; 2];

    // SAFETY: pipe2 syscall
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    if ret != 0 {
        return Err(RenderwardError::Io(std::io::Error::last_os_error()));
    }

    // SAFETY: We just created these file descriptors
    let read_end = unsafe { File::from_raw_fd(fds[0]) };
    let write_end = unsafe { File::from_raw_fd(fds[1]) };

    Ok((read_end, write_end))
}

struct Exit {
    child: Child,
    code: Option<i32>,
}

/// A running (or exited, not yet dropped) renderer
pub struct ChildProcess {
    exit: Mutex<Exit>,
    pid: u32,
    started_at: Instant,
    /// Dropped after the process is reaped
    cgroup: Option<Cgroup>,
}

impl ChildProcess {
    pub(super) fn spawn(config: &LaunchConfig, report: &mut SandboxReport) -> Result<Self> {
        let policy = &config.sandbox;
        let mut command = Command::new(&config.executable);
        command.args(config.command_line());

        if let Some(dir) = config
            .working_dir
            .clone()
            .or_else(|| config.executable.parent().map(std::path::Path::to_path_buf))
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            command.current_dir(dir);
        }
        if config.hide_console {
            command.stdin(Stdio::null());
        }

        let mut cgroup = prepare_cgroup(policy, report);
        let ruleset = prepare_landlock(policy, report);
        let capabilities = prepare_capabilities(policy, report);
        let seccomp = prepare_seccomp(policy, report);
        prepare_environment(&mut command, policy, report);

        let (mut status_reader, status_writer) = create_pipe()?;
        let enable_aslr = policy.mitigations && policy.aslr;
        let steps = ChildSteps {
            cgroup_fd: cgroup.as_ref().map(Cgroup::procs_fd),
            capabilities,
            enable_aslr,
            ruleset: Mutex::new(ruleset),
            no_new_privs: policy.reduce_privileges || policy.restricted_sids,
            seccomp,
            status_fd: status_writer.as_raw_fd(),
        };
        let had_landlock = steps.ruleset.lock().is_some();
        let had_seccomp = steps.seccomp.is_some();
        let had_caps = !steps.capabilities.is_empty();
        let no_new_privs = steps.no_new_privs;

        // SAFETY: ChildSteps::run only makes raw syscalls on data prepared
        // above, which is what the post-fork environment permits.
        unsafe {
            command.pre_exec(move || {
                steps.run();
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| {
            RenderwardError::ProcessCreation(format!("{}: {e}", config.executable.display()))
        })?;
        drop(command);
        drop(status_writer);

        let mut status = [0u8; 4];
        let failed = match status_reader.read_exact(&mut status) {
            Ok(()) => u32::from_ne_bytes(status),
            Err(e) => {
                tracing::debug!(error = %e, "no sandbox status from child");
                0
            }
        };

        if cgroup.is_some() {
            if failed & STEP_CGROUP == 0 {
                report.applied("job_object");
            } else {
                report.degraded("job_object", "child could not join its cgroup");
                cgroup = None;
            }
        }
        record(report, had_caps, failed & STEP_CAPS, "privileges", "capability drop refused");
        record(report, enable_aslr, failed & STEP_ASLR, "aslr", "personality change refused");
        record(report, had_landlock, failed & STEP_LANDLOCK, "low_integrity", "landlock not enforced");
        record(report, no_new_privs, failed & STEP_NO_NEW_PRIVS, "no_new_privs", "prctl refused");
        if policy.restricted_sids {
            record(report, true, failed & STEP_NO_NEW_PRIVS, "restricted_sids", "prctl refused");
        }
        if had_seccomp {
            for step in seccomp_steps(policy) {
                record(report, true, failed & STEP_SECCOMP, step, "seccomp filter refused");
            }
        }

        let pid = child.id();
        Ok(Self {
            exit: Mutex::new(Exit { child, code: None }),
            pid,
            started_at: Instant::now(),
            cgroup,
        })
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Exit code once the process has been reaped
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.lock().code
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        matches!(self.poll(), Ok(None))
    }

    /// Wait up to `timeout` for the process to exit
    pub fn wait_exit(&self, timeout: Duration) -> Result<Option<i32>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.poll()? {
                return Ok(Some(code));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            std::thread::sleep(remaining.min(EXIT_POLL));
        }
    }

    fn poll(&self) -> Result<Option<i32>> {
        let mut exit = self.exit.lock();
        if exit.code.is_some() {
            return Ok(exit.code);
        }
        if let Some(status) = exit.child.try_wait()? {
            exit.code = Some(exit_code_of(status));
        }
        Ok(exit.code)
    }

    pub fn kill(&self) -> Result<()> {
        let mut exit = self.exit.lock();
        if exit.code.is_none() {
            exit.child.kill()?;
        }
        Ok(())
    }

    /// Stop every thread of the child (`SIGSTOP`)
    pub fn suspend(&self) -> Result<()> {
        self.signal(Signal::SIGSTOP)
    }

    pub fn resume(&self) -> Result<()> {
        self.signal(Signal::SIGCONT)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        if self.exit.lock().code.is_some() {
            return Err(RenderwardError::ProcessCreation(format!(
                "process {} has exited",
                self.pid
            )));
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| RenderwardError::ProcessCreation(format!("pid {} out of range", self.pid)))?;
        kill(Pid::from_raw(pid), signal)?;
        Ok(())
    }

    /// Memory charged to the cgroup, or the resident set without one
    #[must_use]
    pub fn memory_bytes(&self) -> Option<u64> {
        if let Some(cgroup) = &self.cgroup {
            return cgroup.memory_current().ok();
        }
        let statm = std::fs::read_to_string(format!("/proc/{}/statm", self.pid)).ok()?;
        let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        // SAFETY: sysconf has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(page).ok().map(|page| resident * page)
    }

    /// Whether the cgroup saw an OOM kill
    #[must_use]
    pub fn was_oom_killed(&self) -> bool {
        self.cgroup
            .as_ref()
            .is_some_and(|cgroup| cgroup.was_oom_killed().unwrap_or(false))
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let exit = self.exit.get_mut();
        if exit.code.is_none() {
            let _ = exit.child.kill();
            if let Ok(status) = exit.child.wait() {
                exit.code = Some(exit_code_of(status));
            }
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

fn record(report: &mut SandboxReport, requested: bool, failed: u32, step: &'static str, why: &str) {
    if !requested {
        return;
    }
    if failed == 0 {
        report.applied(step);
    } else {
        report.degraded(step, why);
    }
}

fn prepare_cgroup(policy: &SandboxPolicy, report: &mut SandboxReport) -> Option<Cgroup> {
    if !policy.job_object {
        return None;
    }
    let limits = CgroupLimits::from_policy(policy);
    match Cgroup::create(&policy.cgroup_parent, &limits, policy.kill_on_job_close) {
        Ok(cgroup) => Some(cgroup),
        Err(e) => {
            report.degraded("job_object", e.to_string());
            None
        }
    }
}

fn prepare_landlock(policy: &SandboxPolicy, report: &mut SandboxReport) -> Option<RulesetCreated> {
    if !policy.low_integrity {
        return None;
    }
    match LandlockConfig::for_renderer(&policy.writable_paths).prepare() {
        Ok(ruleset) => Some(ruleset),
        Err(e) => {
            report.degraded("low_integrity", e.to_string());
            None
        }
    }
}

fn prepare_capabilities(policy: &SandboxPolicy, report: &mut SandboxReport) -> Vec<libc::c_ulong> {
    if !policy.reduce_privileges {
        return Vec::new();
    }
    match privileges::plan() {
        CapabilityPlan::NothingHeld => {
            report.applied("privileges");
            Vec::new()
        }
        CapabilityPlan::Drop(indices) => indices,
        CapabilityPlan::Unable => {
            report.degraded("privileges", "CAP_SETPCAP not held");
            Vec::new()
        }
    }
}

fn seccomp_steps(policy: &SandboxPolicy) -> Vec<&'static str> {
    let mut steps = Vec::new();
    if policy.mitigations && policy.prohibit_dynamic_code {
        steps.push("prohibit_dynamic_code");
    }
    if policy.mitigations && policy.win32k_lockdown {
        steps.push("win32k_lockdown");
    }
    steps
}

fn prepare_seccomp(policy: &SandboxPolicy, report: &mut SandboxReport) -> Option<BpfProgram> {
    if !policy.mitigations {
        return None;
    }
    if policy.dep {
        // NX is enforced by the kernel for every process.
        report.applied("dep");
    }
    if policy.control_flow_guard {
        report.degraded("control_flow_guard", "no runtime equivalent on Linux");
    }
    if policy.enforce_code_signing {
        report.degraded("code_signing", "no runtime equivalent on Linux");
    }

    let config = SeccompConfig {
        deny_dynamic_code: policy.prohibit_dynamic_code,
        deny_kernel_surface: policy.win32k_lockdown,
    };
    if config.is_empty() {
        return None;
    }
    match config.compile() {
        Ok(program) => Some(program),
        Err(e) => {
            for step in seccomp_steps(policy) {
                report.degraded(step, e.to_string());
            }
            None
        }
    }
}

fn prepare_environment(command: &mut Command, policy: &SandboxPolicy, report: &mut SandboxReport) {
    if policy.mitigations && policy.disable_extension_points {
        for var in PRELOAD_VARS {
            command.env_remove(var);
        }
        report.applied("extension_points");
    }
    if policy.restrict_ui_access {
        for var in DISPLAY_VARS {
            command.env_remove(var);
        }
        report.applied("ui_restrictions");
    }
}
