//! Command/result bridge to one renderer process
//!
//! The bridge owns the parent side of both transports, a receive thread that
//! drains them, and a monitor thread that follows the supervised process.
//! Every sent command is registered in a [`Correlator`] before it is
//! dispatched, so a reply can never arrive ahead of its waiter.

use crate::config::{BridgeConfig, IpcMode, LaunchConfig};
use crate::correlation::{Correlator, ReplyHandle};
use crate::pipe::NamedPipeChannel;
use crate::shm::SharedMemoryChannel;
use crate::supervisor::{DEFAULT_TERMINATE_TIMEOUT, Supervisor, guarded};
use crate::transport::{ChannelStats, TransportChannel, TransportKind};
use crate::{CommandType, RenderCommand, RenderResult, RenderwardError, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Message every locally expired command resolves with
pub const TIMEOUT_MESSAGE: &str = "Command timed out";

/// Message pending commands resolve with when the bridge shuts down
pub const SHUTDOWN_MESSAGE: &str = "IPC shutdown";

const HANDSHAKE_RETRY: Duration = Duration::from_millis(100);

/// Counters exposed by [`RenderBridge::statistics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BridgeStatistics {
    pub commands_sent: u64,
    pub results_received: u64,
    pub commands_failed: u64,
    pub commands_timed_out: u64,
    /// Commands still waiting for a result
    pub queued_commands: usize,
    pub average_round_trip_ms: f64,
    pub shared_memory: Option<ChannelStats>,
    pub named_pipe: Option<ChannelStats>,
}

#[derive(Debug, Default)]
struct Counters {
    sent: u64,
    received: u64,
    failed: u64,
    timed_out: u64,
    rtt_samples: u64,
    average_rtt_ms: f64,
}

impl Counters {
    fn record_round_trip(&mut self, sample: Duration) {
        self.rtt_samples += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.rtt_samples as f64;
        let sample_ms = sample.as_secs_f64() * 1000.0;
        self.average_rtt_ms = self.average_rtt_ms.mul_add(n - 1.0, sample_ms) / n;
    }
}

type ResultCallback = Arc<dyn Fn(&RenderResult) + Send + Sync>;
type PidCallback = Arc<dyn Fn(u32) + Send + Sync>;
type ExitCallback = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    message: Option<ResultCallback>,
    started: Option<PidCallback>,
    exited: Option<ExitCallback>,
}

struct Inner {
    config: BridgeConfig,
    supervisor: Arc<Supervisor>,
    launch: RwLock<Option<LaunchConfig>>,
    shm: RwLock<Option<Arc<SharedMemoryChannel>>>,
    pipe: RwLock<Option<Arc<NamedPipeChannel>>>,
    pending: Correlator<u64, RenderResult>,
    next_id: AtomicU64,
    default_timeout_ms: AtomicU64,
    running: AtomicBool,
    ready: AtomicBool,
    counters: Mutex<Counters>,
    last_error: Mutex<Option<String>>,
    callbacks: RwLock<Callbacks>,
}

/// A command in flight; resolve it with [`wait`](Self::wait)
pub struct PendingResult {
    handle: ReplyHandle<u64, RenderResult>,
    widget_id: u32,
    inner: Arc<Inner>,
}

impl PendingResult {
    #[must_use]
    pub const fn command_id(&self) -> u64 {
        *self.handle.id()
    }

    /// Block for at most `timeout`; a missed deadline resolves as failure
    #[must_use]
    pub fn wait(self, timeout: Duration) -> RenderResult {
        let Self {
            handle,
            widget_id,
            inner,
        } = self;
        let id = *handle.id();
        match handle.wait(&inner.pending, timeout) {
            Some(result) => fill_widget(result, widget_id),
            None => {
                inner.note_timeout(id);
                RenderResult::failure(id, widget_id, TIMEOUT_MESSAGE)
            }
        }
    }

    /// The result, if it has already arrived
    #[must_use]
    pub fn try_take(&self) -> Option<RenderResult> {
        self.handle
            .try_take()
            .map(|result| fill_widget(result, self.widget_id))
    }
}

// Locally generated failures do not know the widget.
fn fill_widget(mut result: RenderResult, widget_id: u32) -> RenderResult {
    if result.widget_id == 0 {
        result.widget_id = widget_id;
    }
    result
}

impl Inner {
    fn shm(&self) -> Option<Arc<SharedMemoryChannel>> {
        self.shm.read().clone()
    }

    fn pipe(&self) -> Option<Arc<NamedPipeChannel>> {
        self.pipe.read().clone()
    }

    fn set_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    fn note_timeout(&self, id: u64) {
        let mut counters = self.counters.lock();
        counters.timed_out += 1;
        counters.failed += 1;
        drop(counters);
        tracing::warn!(command_id = id, "command timed out");
        self.set_error(format!("command {id} timed out"));
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms.load(Ordering::Relaxed))
    }

    /// Put `command` on the preferred transport
    /// Put `command` on a transport, spending at most `budget` on it
    fn dispatch(&self, command: &RenderCommand, budget: Duration) -> Result<TransportKind> {
        let deadline = Instant::now() + budget;
        let mode = self.config.mode;
        let mut last = RenderwardError::NotConnected;

        if mode.uses_shared_memory() {
            if let Some(shm) = self.shm() {
                match shm.send_command_within(command, budget) {
                    Ok(()) => return Ok(TransportKind::SharedMemory),
                    Err(e) if mode == IpcMode::Hybrid => {
                        tracing::debug!(command_id = command.command_id, error = %e, "shared memory send failed, trying pipe");
                        last = e;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if mode.uses_pipe() {
            if let Some(pipe) = self.pipe() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                pipe.send_command_within(command, remaining)?;
                return Ok(TransportKind::NamedPipe);
            }
        }
        Err(last)
    }

    fn submit(self: &Arc<Self>, mut command: RenderCommand, timeout: Duration) -> PendingResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        command.command_id = id;
        let widget_id = command.widget_id;
        let handle = self.pending.register(id, timeout);
        self.counters.lock().sent += 1;

        match self.dispatch(&command, timeout) {
            Ok(kind) => {
                tracing::trace!(command_id = id, widget_id, command_type = ?command.command_type, ?kind, "command sent");
            }
            Err(e) => {
                tracing::warn!(command_id = id, widget_id, error = %e, "command send failed");
                self.counters.lock().failed += 1;
                self.set_error(e.to_string());
                self.pending
                    .fulfill(&id, RenderResult::failure(id, widget_id, format!("send failed: {e}")));
            }
        }

        PendingResult {
            handle,
            widget_id,
            inner: Arc::clone(self),
        }
    }

    /// The whole exchange, send included, fits in `timeout`
    fn send(self: &Arc<Self>, command: RenderCommand, timeout: Duration) -> RenderResult {
        let started = Instant::now();
        let pending = self.submit(command, timeout);
        pending.wait(timeout.saturating_sub(started.elapsed()))
    }

    fn handle_result(&self, result: RenderResult, via: TransportKind) {
        let id = result.command_id;
        if let Some(delivery) = self.pending.fulfill(&id, result.clone()) {
            let mut counters = self.counters.lock();
            counters.received += 1;
            counters.record_round_trip(delivery.round_trip);
            if !result.is_success() {
                counters.failed += 1;
            }
            drop(counters);
            tracing::trace!(command_id = id, ?via, rtt_us = delivery.round_trip.as_micros(), "result correlated");
        } else {
            tracing::debug!(command_id = id, ?via, "uncorrelated result dropped");
        }
        if !result.is_success() {
            self.set_error(result.error_message.clone());
        }

        let callback = self.callbacks.read().message.clone();
        if let Some(cb) = callback {
            guarded("on_message", || cb(&result));
        }
    }

    fn sweep(&self) {
        let expired = self
            .pending
            .expire(|id| RenderResult::failure(*id, 0, TIMEOUT_MESSAGE));
        for id in expired {
            self.note_timeout(id);
        }
    }

    fn receive_loop(self: Arc<Self>) {
        let slice = self.config.poll_interval() / 2;
        tracing::debug!("bridge receive loop started");
        while self.running.load(Ordering::Acquire) {
            let mut waited = false;

            if let Some(shm) = self.shm() {
                waited = true;
                match shm.receive_result(slice) {
                    Ok(Some(result)) => self.handle_result(result, TransportKind::SharedMemory),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "shared memory receive failed");
                        self.set_error(e.to_string());
                    }
                }
            }

            if let Some(pipe) = self.pipe() {
                waited = true;
                if pipe.is_connected() {
                    match pipe.receive_result(slice) {
                        Ok(Some(result)) => self.handle_result(result, TransportKind::NamedPipe),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "pipe receive failed");
                            self.set_error(e.to_string());
                        }
                    }
                } else if let Err(e) = pipe.accept(slice) {
                    tracing::warn!(error = %e, "pipe accept failed");
                    std::thread::sleep(slice);
                }
            }

            if !waited {
                std::thread::sleep(slice);
            }
            self.sweep();
        }
        tracing::debug!("bridge receive loop finished");
    }

    /// Send Initialize until the renderer answers or the startup window ends
    fn handshake(self: &Arc<Self>) -> Result<()> {
        self.ready.store(false, Ordering::Release);
        let deadline = Instant::now() + Duration::from_millis(self.config.startup_timeout_ms);
        let per_attempt = Duration::from_millis(self.config.handshake_timeout_ms);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = self.send(RenderCommand::new(CommandType::Initialize, 0), per_attempt);
            if result.is_success() {
                self.ready.store(true, Ordering::Release);
                tracing::info!(attempts, "renderer handshake complete");
                return Ok(());
            }
            if Instant::now() >= deadline || !self.running.load(Ordering::Acquire) {
                let message = format!(
                    "handshake failed after {attempts} attempts: {}",
                    result.error_message
                );
                tracing::error!(attempts, error = %result.error_message, "renderer handshake failed");
                self.set_error(message.clone());
                return Err(RenderwardError::ChannelInit(message));
            }
            std::thread::sleep(HANDSHAKE_RETRY);
        }
    }

    fn monitor_loop(self: Arc<Self>) {
        let mut seen = self.supervisor.pid();
        let mut was_alive = self.supervisor.is_alive();
        tracing::debug!(pid = ?seen, "bridge process monitor started");

        while self.running.load(Ordering::Acquire) {
            std::thread::sleep(self.config.poll_interval());

            let pid = self.supervisor.pid();
            let alive = self.supervisor.is_alive();
            let replaced = alive && pid.is_some() && pid != seen;

            if was_alive && (!alive || replaced) {
                was_alive = false;
                self.ready.store(false, Ordering::Release);
                let code = self.exit_code(replaced);
                tracing::warn!(pid = ?seen, exit_code = code, "renderer process exited");
                let callback = self.callbacks.read().exited.clone();
                if let Some(cb) = callback {
                    guarded("on_process_exited", || cb(code));
                }
            }

            if replaced {
                seen = pid;
                was_alive = true;
                if let Some(pid) = pid {
                    tracing::info!(pid, "renderer restarted, repeating handshake");
                    if self.handshake().is_ok() {
                        let callback = self.callbacks.read().started.clone();
                        if let Some(cb) = callback {
                            guarded("on_process_started", || cb(pid));
                        }
                    }
                }
            }
        }
        tracing::debug!("bridge process monitor finished");
    }

    fn exit_code(&self, replaced: bool) -> i32 {
        let current = if replaced {
            None
        } else {
            self.supervisor.process_info().and_then(|info| info.exit_code)
        };
        current
            .or_else(|| self.supervisor.last_exit().map(|(code, _)| code))
            .unwrap_or(-1)
    }
}

/// Typed command API over the transports to one renderer
pub struct RenderBridge {
    inner: Arc<Inner>,
    receive: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl RenderBridge {
    /// Bridge with its own supervisor
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_supervisor(config, Arc::new(Supervisor::new()))
    }

    #[must_use]
    pub fn with_supervisor(config: BridgeConfig, supervisor: Arc<Supervisor>) -> Self {
        let timeout = config.default_timeout_ms;
        Self {
            inner: Arc::new(Inner {
                config,
                supervisor,
                launch: RwLock::new(None),
                shm: RwLock::new(None),
                pipe: RwLock::new(None),
                pending: Correlator::new(),
                next_id: AtomicU64::new(1),
                default_timeout_ms: AtomicU64::new(timeout),
                running: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                counters: Mutex::new(Counters::default()),
                last_error: Mutex::new(None),
                callbacks: RwLock::new(Callbacks::default()),
            }),
            receive: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    /// Create the transports and start the receive loop
    ///
    /// In hybrid mode one transport failing is tolerated as long as the
    /// other comes up.
    pub fn initialize(&self) -> Result<()> {
        if self.inner.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let config = &self.inner.config;
        config.validate()?;

        let mut failures = Vec::new();
        if config.mode.uses_shared_memory() {
            match SharedMemoryChannel::create(&config.shared_memory_name, config.shared_memory_size) {
                Ok(shm) => {
                    let shm = shm.with_slot_wait(Duration::from_millis(config.slot_wait_ms));
                    *self.inner.shm.write() = Some(Arc::new(shm));
                }
                Err(e) => {
                    tracing::warn!(name = %config.shared_memory_name, error = %e, "shared memory channel unavailable");
                    failures.push(e.to_string());
                }
            }
        }
        if config.mode.uses_pipe() {
            match NamedPipeChannel::create_server(&config.pipe_name, config.max_message_size) {
                Ok(pipe) => *self.inner.pipe.write() = Some(Arc::new(pipe)),
                Err(e) => {
                    tracing::warn!(name = %config.pipe_name, error = %e, "pipe channel unavailable");
                    failures.push(e.to_string());
                }
            }
        }
        if self.inner.shm().is_none() && self.inner.pipe().is_none() {
            let message = failures.join("; ");
            self.inner.set_error(message.clone());
            return Err(RenderwardError::ChannelInit(message));
        }

        self.inner.running.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("renderward-receive".into())
            .spawn(move || inner.receive_loop())?;
        *self.receive.lock() = Some(handle);

        tracing::info!(mode = ?config.mode, "render bridge initialized");
        Ok(())
    }

    /// Launch the renderer with this bridge's endpoints and handshake with it
    pub fn start_render_process(&self, mut launch: LaunchConfig) -> Result<u32> {
        self.initialize()?;
        launch.ipc = Some(self.inner.config.endpoints());
        *self.inner.launch.write() = Some(launch.clone());

        let pid = self.inner.supervisor.launch(launch)?;
        if let Err(e) = self.inner.handshake() {
            self.inner.supervisor.terminate(DEFAULT_TERMINATE_TIMEOUT);
            return Err(e);
        }

        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            let inner = Arc::clone(&self.inner);
            *monitor = Some(
                std::thread::Builder::new()
                    .name("renderward-bridge-monitor".into())
                    .spawn(move || inner.monitor_loop())?,
            );
        }
        drop(monitor);

        let callback = self.inner.callbacks.read().started.clone();
        if let Some(cb) = callback {
            guarded("on_process_started", || cb(pid));
        }
        Ok(pid)
    }

    /// Handshake with a renderer that was started some other way
    pub fn handshake(&self) -> Result<()> {
        self.inner.handshake()
    }

    /// Ask the renderer to exit, then make sure it does
    pub fn stop_render_process(&self, timeout: Duration) {
        let supervisor = &self.inner.supervisor;
        supervisor.request_stop();
        if supervisor.is_alive() {
            self.send_command_fire_and_forget(RenderCommand::new(CommandType::Destroy, 0));
            let deadline = Instant::now() + timeout;
            while supervisor.is_alive() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        supervisor.terminate(timeout);
        self.inner.ready.store(false, Ordering::Release);
    }

    /// Send and return immediately; the reply arrives on the handle
    pub fn send_command_async(&self, command: RenderCommand) -> PendingResult {
        self.inner.submit(command, self.inner.default_timeout())
    }

    /// Send and block for at most `timeout`
    pub fn send_command(&self, command: RenderCommand, timeout: Duration) -> RenderResult {
        self.inner.send(command, timeout)
    }

    /// Send with the default timeout
    pub fn send(&self, command: RenderCommand) -> RenderResult {
        self.inner.send(command, self.inner.default_timeout())
    }

    /// Dispatch without waiting for or correlating a reply
    pub fn send_command_fire_and_forget(&self, mut command: RenderCommand) -> bool {
        command.command_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        match self.inner.dispatch(&command, self.inner.default_timeout()) {
            Ok(_) => {
                self.inner.counters.lock().sent += 1;
                true
            }
            Err(e) => {
                tracing::debug!(command_id = command.command_id, error = %e, "fire-and-forget send failed");
                self.inner.set_error(e.to_string());
                false
            }
        }
    }

    /// Process alive and at least one transport connected
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let channel_ready = self.inner.shm().is_some_and(|c| c.is_connected())
            || self.inner.pipe().is_some_and(|c| c.is_connected());
        self.inner.supervisor.is_alive() && channel_ready
    }

    /// Whether the last handshake succeeded and the renderer has not exited
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Relaunch a dead renderer, or reset the pipe of an unresponsive one
    pub fn attempt_recovery(&self) -> Result<()> {
        let supervisor = &self.inner.supervisor;
        if !supervisor.is_alive() {
            let launch = self
                .inner
                .launch
                .read()
                .clone()
                .ok_or_else(|| RenderwardError::Config("no renderer was launched".into()))?;
            tracing::info!("recovering: relaunching renderer");
            supervisor.terminate(DEFAULT_TERMINATE_TIMEOUT);
            supervisor.launch(launch)?;
            return self.inner.handshake();
        }

        let reply = self.inner.send(
            RenderCommand::new(CommandType::Initialize, 0),
            Duration::from_millis(self.inner.config.handshake_timeout_ms),
        );
        if reply.is_success() {
            self.inner.ready.store(true, Ordering::Release);
            return Ok(());
        }

        tracing::info!("recovering: resetting the render pipe");
        if let Some(pipe) = self.inner.pipe() {
            pipe.cleanup();
        }
        self.inner.handshake()
    }

    #[must_use]
    pub fn statistics(&self) -> BridgeStatistics {
        let counters = self.inner.counters.lock();
        BridgeStatistics {
            commands_sent: counters.sent,
            results_received: counters.received,
            commands_failed: counters.failed,
            commands_timed_out: counters.timed_out,
            queued_commands: self.inner.pending.len(),
            average_round_trip_ms: counters.average_rtt_ms,
            shared_memory: self.inner.shm().map(|c| c.statistics()),
            named_pipe: self.inner.pipe().map(|c| c.statistics()),
        }
    }

    pub fn reset_statistics(&self) {
        *self.inner.counters.lock() = Counters::default();
        if let Some(shm) = self.inner.shm() {
            shm.reset_statistics();
        }
        if let Some(pipe) = self.inner.pipe() {
            pipe.reset_statistics();
        }
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.inner.default_timeout_ms.store(ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.inner.supervisor
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn on_message(&self, f: impl Fn(&RenderResult) + Send + Sync + 'static) {
        self.inner.callbacks.write().message = Some(Arc::new(f));
    }

    pub fn on_process_started(&self, f: impl Fn(u32) + Send + Sync + 'static) {
        self.inner.callbacks.write().started = Some(Arc::new(f));
    }

    pub fn on_process_exited(&self, f: impl Fn(i32) + Send + Sync + 'static) {
        self.inner.callbacks.write().exited = Some(Arc::new(f));
    }

    /// Stop the renderer and threads, fail what is pending, release transports
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.inner.supervisor.is_running() || self.inner.supervisor.is_alive() {
            self.stop_render_process(DEFAULT_TERMINATE_TIMEOUT);
        }

        self.inner.running.store(false, Ordering::Release);
        for handle in [self.receive.lock().take(), self.monitor.lock().take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                tracing::error!("bridge thread panicked");
            }
        }

        let failed = self
            .inner
            .pending
            .fail_all(|id| RenderResult::failure(*id, 0, SHUTDOWN_MESSAGE));
        if failed > 0 {
            tracing::info!(failed, "pending commands failed on shutdown");
        }

        if let Some(shm) = self.inner.shm.write().take() {
            shm.cleanup();
        }
        if let Some(pipe) = self.inner.pipe.write().take() {
            pipe.cleanup();
        }
        self.inner.ready.store(false, Ordering::Release);
    }
}

impl Drop for RenderBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::{ChildEndpoint, EchoBackend};
    use crate::config::IpcEndpoints;
    use crate::pipe::tests::pipe_name;
    use crate::{ContentParameters, ResultStatus};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn config(mode: IpcMode, tag: &str) -> BridgeConfig {
        BridgeConfig {
            mode,
            shared_memory_name: pipe_name(&format!("{tag}_shm")),
            shared_memory_size: 64 * 1024,
            pipe_name: pipe_name(tag),
            poll_interval_ms: 20,
            handshake_timeout_ms: 500,
            startup_timeout_ms: 3000,
            ..BridgeConfig::default()
        }
    }

    /// Run an echo renderer on a thread against `endpoints`
    fn spawn_echo(endpoints: IpcEndpoints) -> std::thread::JoinHandle<u64> {
        std::thread::spawn(move || {
            let mut endpoint =
                ChildEndpoint::connect(&endpoints, 1024 * 1024, Duration::from_secs(3)).unwrap();
            endpoint.run(&mut EchoBackend::default()).unwrap()
        })
    }

    #[test]
    fn unanswered_command_times_out_and_leaves_nothing_pending() {
        let bridge = RenderBridge::new(config(IpcMode::SharedMemory, "timeout"));
        bridge.initialize().unwrap();

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let result = bridge.send_command(RenderCommand::new(CommandType::Render, 4), timeout);
        let elapsed = started.elapsed();

        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.error_message, TIMEOUT_MESSAGE);
        assert_eq!(result.widget_id, 4);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));

        let stats = bridge.statistics();
        assert_eq!(stats.queued_commands, 0);
        assert_eq!(stats.commands_timed_out, 1);
        assert!(bridge.last_error().is_some());
    }

    #[test]
    fn busy_slot_fails_without_overwriting() {
        let bridge = RenderBridge::new(config(IpcMode::SharedMemory, "busy"));
        bridge.initialize().unwrap();

        // Nobody reads the first command, so the slot stays occupied.
        let first = bridge.send_command_async(RenderCommand::new(CommandType::Render, 1));
        let second = bridge.send_command(
            RenderCommand::new(CommandType::Render, 2),
            Duration::from_millis(500),
        );
        assert_eq!(second.status, ResultStatus::Failure);
        assert!(second.error_message.starts_with("send failed"));
        assert_eq!(first.command_id() + 1, second.command_id);
        assert!(first.try_take().is_none());
    }

    #[test]
    fn renderer_that_stops_reading_cannot_stall_send_past_its_timeout() {
        let bridge = RenderBridge::new(config(IpcMode::NamedPipes, "stalled"));
        bridge.initialize().unwrap();
        let pipe = bridge.config().endpoints().named_pipe.unwrap();
        let _renderer = NamedPipeChannel::connect(&pipe, 1 << 20, Duration::from_secs(2)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !bridge.inner.pipe().is_some_and(|p| p.is_connected()) {
            assert!(Instant::now() < deadline, "pipe never accepted");
            std::thread::sleep(Duration::from_millis(10));
        }

        let timeout = Duration::from_millis(300);
        for widget in 0..3 {
            let command = RenderCommand::new(CommandType::UpdateContent, widget).with_content(
                ContentParameters {
                    source_url: "s".repeat(768 * 1024),
                    ..ContentParameters::default()
                },
            );
            let started = Instant::now();
            let result = bridge.send_command(command, timeout);
            assert_eq!(result.status, ResultStatus::Failure);
            assert!(started.elapsed() < timeout + Duration::from_secs(1));
        }
        assert_eq!(bridge.statistics().queued_commands, 0);
        bridge.shutdown();
    }

    #[test]
    fn oversized_command_fails_on_shared_memory_only() {
        let bridge = RenderBridge::new(config(IpcMode::SharedMemory, "oversize"));
        bridge.initialize().unwrap();

        let content = ContentParameters {
            source_url: "x".repeat(64 * 1024),
            ..ContentParameters::default()
        };
        let result = bridge.send_command(
            RenderCommand::new(CommandType::UpdateContent, 9).with_content(content),
            Duration::from_millis(200),
        );
        assert_eq!(result.status, ResultStatus::Failure);
        assert!(result.error_message.contains("too large"), "{}", result.error_message);
    }

    #[test]
    fn hybrid_roundtrip_with_echo_renderer() {
        let bridge = RenderBridge::new(config(IpcMode::Hybrid, "hybrid"));
        bridge.initialize().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        bridge.on_message(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let child = spawn_echo(bridge.config().endpoints());
        bridge.handshake().unwrap();
        assert!(bridge.is_ready());

        let result = bridge.send(RenderCommand::new(CommandType::Render, 42));
        assert!(result.is_success(), "{}", result.error_message);
        assert_eq!(result.widget_id, 42);

        let stats = bridge.statistics();
        assert!(stats.results_received >= 2);
        assert!(stats.average_round_trip_ms >= 0.0);
        assert!(seen.load(Ordering::SeqCst) >= 2);

        assert!(bridge.send_command_fire_and_forget(RenderCommand::new(CommandType::Destroy, 0)));
        assert!(child.join().unwrap() >= 2);
        bridge.shutdown();
    }

    #[test]
    fn pipe_only_roundtrip() {
        let bridge = RenderBridge::new(config(IpcMode::NamedPipes, "pipeonly"));
        bridge.initialize().unwrap();
        let child = spawn_echo(bridge.config().endpoints());
        bridge.handshake().unwrap();

        let result = bridge.send_command(
            RenderCommand::new(CommandType::Resize, 3),
            Duration::from_secs(2),
        );
        assert!(result.is_success());
        assert_eq!(bridge.statistics().named_pipe.unwrap().messages_sent, 2);

        bridge.send_command_fire_and_forget(RenderCommand::new(CommandType::Destroy, 0));
        child.join().unwrap();
    }

    #[test]
    fn concurrent_callers_get_their_own_results() {
        let bridge = Arc::new(RenderBridge::new(config(IpcMode::Hybrid, "concurrent")));
        bridge.initialize().unwrap();
        let child = spawn_echo(bridge.config().endpoints());
        bridge.handshake().unwrap();

        let callers: Vec<_> = (1..=8u32)
            .map(|widget| {
                let bridge = Arc::clone(&bridge);
                std::thread::spawn(move || {
                    (0..5)
                        .map(|_| {
                            let result = bridge.send_command(
                                RenderCommand::new(CommandType::Render, widget),
                                Duration::from_secs(5),
                            );
                            assert!(result.is_success(), "{}", result.error_message);
                            assert_eq!(result.widget_id, widget);
                            result.command_id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: Vec<u64> = callers
            .into_iter()
            .flat_map(|caller| caller.join().unwrap())
            .collect();
        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(bridge.statistics().queued_commands, 0);

        bridge.send_command_fire_and_forget(RenderCommand::new(CommandType::Destroy, 0));
        child.join().unwrap();
    }

    #[test]
    fn shutdown_fails_pending_commands() {
        let bridge = RenderBridge::new(config(IpcMode::SharedMemory, "shutdown"));
        bridge.initialize().unwrap();
        bridge.set_default_timeout(Duration::from_secs(60));

        let pending = bridge.send_command_async(RenderCommand::new(CommandType::Render, 6));
        bridge.shutdown();
        bridge.shutdown();

        let result = pending.wait(Duration::from_secs(1));
        assert_eq!(result.error_message, SHUTDOWN_MESSAGE);
        assert_eq!(result.widget_id, 6);
        assert!(!bridge.is_healthy());
    }

    #[test]
    fn statistics_reset() {
        let bridge = RenderBridge::new(config(IpcMode::SharedMemory, "reset"));
        bridge.initialize().unwrap();
        let _ = bridge.send_command(
            RenderCommand::new(CommandType::Render, 1),
            Duration::from_millis(20),
        );
        assert_eq!(bridge.statistics().commands_sent, 1);
        bridge.reset_statistics();
        let stats = bridge.statistics();
        assert_eq!(stats.commands_sent, 0);
        assert_eq!(stats.shared_memory.unwrap().messages_sent, 0);
    }
}
