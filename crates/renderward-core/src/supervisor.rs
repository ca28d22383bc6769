//! Renderer process supervision
//!
//! A [`Supervisor`] owns the current [`ChildProcess`] and one monitor
//! thread. The monitor waits on the child in `monitor_interval` slices so a
//! stop request is noticed promptly. When the child exits the restart
//! policy decides whether a fresh, fully sandboxed child replaces it.

use crate::config::LaunchConfig;
use crate::isolation::SandboxReport;
use crate::process::{ChildProcess, ProcessInfo, spawn_sandboxed};
use crate::{RenderwardError, Result};
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default wait in [`Supervisor::terminate`]
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_millis(5000);

const STOP_CHECK: Duration = Duration::from_millis(50);

type PidCallback = Arc<dyn Fn(u32) + Send + Sync>;
type StoppedCallback = Arc<dyn Fn(u32, i32) + Send + Sync>;
type CrashedCallback = Arc<dyn Fn(i32, bool) + Send + Sync>;
type FailedCallback = Arc<dyn Fn(&RenderwardError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    started: Option<PidCallback>,
    stopped: Option<StoppedCallback>,
    crashed: Option<CrashedCallback>,
    failed: Option<FailedCallback>,
}

/// Run a user callback without letting a panic escape the calling thread
pub(crate) fn guarded(name: &'static str, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(callback = name, "callback panicked");
    }
}

struct Inner {
    config: RwLock<LaunchConfig>,
    process: Mutex<Option<Arc<ChildProcess>>>,
    report: Mutex<Option<SandboxReport>>,
    running: AtomicBool,
    stop: AtomicBool,
    consecutive_restarts: AtomicU32,
    total_restarts: AtomicU32,
    last_exit: Mutex<Option<(i32, bool)>>,
    callbacks: RwLock<Callbacks>,
}

impl Inner {
    fn current(&self) -> Option<Arc<ChildProcess>> {
        self.process.lock().clone()
    }

    fn spawn_child(&self) -> Result<u32> {
        let config = self.config.read().clone();
        let (child, report) = spawn_sandboxed(&config)?;
        let pid = child.pid();
        *self.process.lock() = Some(Arc::new(child));
        *self.report.lock() = Some(report);

        let started = self.callbacks.read().started.clone();
        if let Some(cb) = started {
            guarded("on_started", || cb(pid));
        }
        Ok(pid)
    }

    fn notify_exit(&self, pid: u32, code: i32, crashed: bool) {
        let (stopped, on_crash) = {
            let callbacks = self.callbacks.read();
            (callbacks.stopped.clone(), callbacks.crashed.clone())
        };
        if let Some(cb) = stopped {
            guarded("on_stopped", || cb(pid, code));
        }
        if let Some(cb) = on_crash {
            guarded("on_crashed", || cb(code, crashed));
        }
    }

    fn notify_failed(&self, error: &RenderwardError) {
        let failed = self.callbacks.read().failed.clone();
        if let Some(cb) = failed {
            guarded("on_failed", || cb(error));
        }
    }

    /// Sleep for `total`, waking early on a stop request; false if stopped
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(STOP_CHECK));
        }
    }

    fn monitor(self: Arc<Self>) {
        tracing::debug!("monitor thread started");
        while !self.stop.load(Ordering::Acquire) {
            let Some(child) = self.current() else {
                break;
            };
            let interval = self.config.read().monitor_interval();

            let code = match child.wait_exit(interval) {
                Ok(Some(code)) => code,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(pid = child.pid(), error = %e, "liveness check failed");
                    std::thread::sleep(STOP_CHECK);
                    continue;
                }
            };
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let pid = child.pid();
            let crashed = code != 0;
            if crashed {
                tracing::warn!(pid, exit_code = code, "renderer crashed");
            } else {
                tracing::info!(pid, exit_code = code, "renderer exited");
            }
            *self.last_exit.lock() = Some((code, crashed));
            self.notify_exit(pid, code, crashed);

            if !self.restart_after_exit(code) {
                break;
            }
        }
        self.running.store(false, Ordering::Release);
        tracing::debug!("monitor thread finished");
    }

    /// Apply the restart policy; true once a replacement child is running
    fn restart_after_exit(&self, code: i32) -> bool {
        let (policy, max_attempts) = {
            let config = self.config.read();
            (config.restart_policy, config.max_restart_attempts)
        };
        if !policy.wants_restart(code) {
            tracing::info!(?policy, exit_code = code, "no restart under policy");
            return false;
        }

        loop {
            let attempts = self.consecutive_restarts.load(Ordering::Acquire);
            if attempts >= max_attempts {
                tracing::error!(attempts, "restart attempts exhausted");
                self.notify_failed(&RenderwardError::RestartsExhausted(attempts));
                return false;
            }

            let delay = self.config.read().restart_delay(attempts);
            tracing::info!(attempt = attempts + 1, delay_ms = delay.as_millis(), "restarting renderer");
            if !self.sleep_unless_stopped(delay) {
                return false;
            }

            self.consecutive_restarts.fetch_add(1, Ordering::AcqRel);
            self.total_restarts.fetch_add(1, Ordering::AcqRel);
            match self.spawn_child() {
                Ok(pid) => {
                    tracing::info!(pid, attempt = attempts + 1, "renderer restarted");
                    return true;
                }
                Err(e) => {
                    tracing::error!(error = %e, "restart failed");
                    self.notify_failed(&e);
                }
            }
        }
    }
}

/// Launches, watches and restarts one renderer process
pub struct Supervisor {
    inner: Arc<Inner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(LaunchConfig::default()),
                process: Mutex::new(None),
                report: Mutex::new(None),
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                consecutive_restarts: AtomicU32::new(0),
                total_restarts: AtomicU32::new(0),
                last_exit: Mutex::new(None),
                callbacks: RwLock::new(Callbacks::default()),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Start the renderer described by `config` and begin monitoring it
    ///
    /// Returns the child's pid. The consecutive-restart counter starts over
    /// with every launch.
    pub fn launch(&self, config: LaunchConfig) -> Result<u32> {
        if self.is_running() {
            return Err(RenderwardError::ProcessCreation(
                "a renderer is already running".into(),
            ));
        }
        self.join_monitor();

        *self.inner.config.write() = config;
        self.inner.stop.store(false, Ordering::Release);
        self.inner.consecutive_restarts.store(0, Ordering::Release);
        *self.inner.last_exit.lock() = None;

        let pid = match self.inner.spawn_child() {
            Ok(pid) => pid,
            Err(e) => {
                tracing::error!(error = %e, "launch failed");
                self.inner.notify_failed(&e);
                return Err(e);
            }
        };
        self.inner.running.store(true, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("renderward-monitor".into())
            .spawn(move || inner.monitor())?;
        *self.monitor.lock() = Some(handle);
        Ok(pid)
    }

    /// Stop the renderer and the monitor; safe to call repeatedly
    pub fn terminate(&self, timeout: Duration) {
        self.inner.stop.store(true, Ordering::Release);

        if let Some(child) = self.inner.current() {
            if child.is_alive() {
                tracing::info!(pid = child.pid(), "terminating renderer");
                if let Err(e) = child.kill() {
                    tracing::warn!(pid = child.pid(), error = %e, "kill failed");
                }
                if !matches!(child.wait_exit(timeout), Ok(Some(_))) {
                    tracing::warn!(pid = child.pid(), "renderer did not exit in time");
                }
            }
        }

        self.join_monitor();
        // Releases thread, process and job handles.
        self.inner.process.lock().take();
        self.inner.running.store(false, Ordering::Release);
    }

    /// Mark the next exit as intentional so it is not restarted
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
    }

    /// Terminate and launch again with the same configuration
    pub fn restart(&self) -> Result<u32> {
        let config = self.inner.config.read().clone();
        self.terminate(DEFAULT_TERMINATE_TIMEOUT);
        self.launch(config)
    }

    pub fn suspend(&self) -> Result<()> {
        self.inner
            .current()
            .ok_or(RenderwardError::NotConnected)?
            .suspend()
    }

    pub fn resume(&self) -> Result<()> {
        self.inner
            .current()
            .ok_or(RenderwardError::NotConnected)?
            .resume()
    }

    fn join_monitor(&self) {
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("monitor thread panicked");
            }
        }
    }

    /// Whether supervision is active (a child runs or a restart is pending)
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether the current child process is alive
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.current().is_some_and(|child| child.is_alive())
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.current().map(|child| child.pid())
    }

    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        self.inner.current().map(|child| child.started_at().elapsed())
    }

    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.inner.consecutive_restarts.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn total_restarts(&self) -> u32 {
        self.inner.total_restarts.load(Ordering::Acquire)
    }

    /// Exit code and crash flag of the most recent exit
    #[must_use]
    pub fn last_exit(&self) -> Option<(i32, bool)> {
        *self.inner.last_exit.lock()
    }

    /// Sandbox outcome of the most recent spawn
    #[must_use]
    pub fn sandbox_report(&self) -> Option<SandboxReport> {
        self.inner.report.lock().clone()
    }

    #[must_use]
    pub fn process_info(&self) -> Option<ProcessInfo> {
        let child = self.inner.current()?;
        let exit_code = child.exit_code();
        Some(ProcessInfo {
            pid: child.pid(),
            uptime: child.started_at().elapsed(),
            restart_count: self.restart_count(),
            crashed: exit_code.is_some_and(|code| code != 0) || child.was_oom_killed(),
            exit_code,
            memory_bytes: child.memory_bytes(),
        })
    }

    pub fn on_started(&self, f: impl Fn(u32) + Send + Sync + 'static) {
        self.inner.callbacks.write().started = Some(Arc::new(f));
    }

    pub fn on_stopped(&self, f: impl Fn(u32, i32) + Send + Sync + 'static) {
        self.inner.callbacks.write().stopped = Some(Arc::new(f));
    }

    pub fn on_crashed(&self, f: impl Fn(i32, bool) + Send + Sync + 'static) {
        self.inner.callbacks.write().crashed = Some(Arc::new(f));
    }

    pub fn on_failed(&self, f: impl Fn(&RenderwardError) + Send + Sync + 'static) {
        self.inner.callbacks.write().failed = Some(Arc::new(f));
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.terminate(DEFAULT_TERMINATE_TIMEOUT);
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::config::{RestartPolicy, SandboxPolicy};
    use std::sync::atomic::AtomicUsize;

    fn shell(script: &str) -> LaunchConfig {
        LaunchConfig::builder("/bin/sh")
            .arg("-c")
            .arg(script)
            .sandbox(SandboxPolicy::permissive())
            .restart_delay(Duration::from_millis(10), Duration::from_millis(40))
            .monitor_interval(Duration::from_millis(20))
            .build()
    }

    fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        f()
    }

    #[test]
    fn crashing_child_is_restarted_until_exhausted() {
        let supervisor = Supervisor::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let crashes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&starts);
        supervisor.on_started(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&crashes);
        supervisor.on_crashed(move |code, crashed| {
            assert_eq!(code, 1);
            assert!(crashed);
            c.fetch_add(1, Ordering::SeqCst);
        });
        let f = Arc::clone(&failures);
        supervisor.on_failed(move |e| f.lock().push(e.to_string()));

        let mut config = shell("exit 1");
        config.restart_policy = RestartPolicy::OnCrash;
        config.max_restart_attempts = 3;
        supervisor.launch(config).unwrap();

        assert!(wait_until(Duration::from_secs(10), || !supervisor.is_running()));
        assert_eq!(starts.load(Ordering::SeqCst), 4);
        assert_eq!(crashes.load(Ordering::SeqCst), 4);
        assert_eq!(supervisor.restart_count(), 3);
        assert_eq!(failures.lock().len(), 1);
        assert_eq!(supervisor.last_exit(), Some((1, true)));
    }

    #[test]
    fn clean_exit_is_not_restarted_on_crash_policy() {
        let supervisor = Supervisor::new();
        supervisor.launch(shell("exit 0")).unwrap();
        assert!(wait_until(Duration::from_secs(5), || !supervisor.is_running()));
        assert_eq!(supervisor.restart_count(), 0);
        assert_eq!(supervisor.last_exit(), Some((0, false)));
    }

    #[test]
    fn terminate_is_idempotent() {
        let supervisor = Supervisor::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&stopped);
        supervisor.on_stopped(move |_, _| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let pid = supervisor.launch(shell("sleep 30")).unwrap();
        assert_eq!(supervisor.pid(), Some(pid));
        assert!(supervisor.is_alive());
        assert!(supervisor.process_info().is_some());

        supervisor.terminate(Duration::from_secs(5));
        supervisor.terminate(Duration::from_secs(5));
        assert!(!supervisor.is_running());
        assert!(!supervisor.is_alive());
        assert_eq!(supervisor.pid(), None);
        // An intentional stop is not an exit the monitor reports.
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn relaunch_resets_restart_counter() {
        let supervisor = Supervisor::new();
        let mut config = shell("exit 3");
        config.max_restart_attempts = 1;
        supervisor.launch(config.clone()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || !supervisor.is_running()));
        assert_eq!(supervisor.restart_count(), 1);

        config.restart_policy = RestartPolicy::Never;
        supervisor.launch(config).unwrap();
        assert_eq!(supervisor.restart_count(), 0);
        assert!(wait_until(Duration::from_secs(5), || !supervisor.is_running()));
        assert_eq!(supervisor.total_restarts(), 1);
    }

    #[test]
    fn launch_failure_reports_creation_error() {
        let supervisor = Supervisor::new();
        let failed = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&failed);
        supervisor.on_failed(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let config = LaunchConfig::builder("/nonexistent/renderer")
            .sandbox(SandboxPolicy::permissive())
            .build();
        assert!(matches!(
            supervisor.launch(config),
            Err(RenderwardError::ProcessCreation(_))
        ));
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(!supervisor.is_running());
    }

    #[test]
    fn suspend_and_resume_running_child() {
        let supervisor = Supervisor::new();
        supervisor.launch(shell("sleep 30")).unwrap();
        supervisor.suspend().unwrap();
        supervisor.resume().unwrap();
        assert!(supervisor.is_alive());
        supervisor.terminate(Duration::from_secs(5));
        assert!(supervisor.suspend().is_err());
    }
}
