//! Server/client message manager over one pipe name
//!
//! Server mode runs a listener thread and one reader thread per accepted
//! connection. Client mode runs a single connection thread that reconnects
//! a bounded number of times. In both modes one sender thread drains the
//! outgoing queue.

use crate::config::{IpcConfig, IpcRole};
use crate::correlation::Correlator;
use crate::ipc::message::{IpcMessage, MessageIds, MessageKind};
use crate::pipe::{PipeConnection, PipeListener};
use crate::supervisor::guarded;
use crate::transport::frame::FrameKind;
use crate::transport::{ConnectionState, StateCell};
use crate::{RenderwardError, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const ACCEPT_SLICE: Duration = Duration::from_millis(100);
const READ_SLICE: Duration = Duration::from_millis(100);
const QUEUE_WAIT: Duration = Duration::from_millis(100);

/// Channel name responses are sent on
pub const RESPONSE_CHANNEL: &str = "response";

type MessageHandler = Arc<dyn Fn(&IpcMessage) -> Option<String> + Send + Sync>;
type ConnectionHandler = Arc<dyn Fn(u32, bool) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&RenderwardError) + Send + Sync>;

/// Public view of one accepted connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub pid: u32,
    pub active: bool,
    /// Time since the last frame in either direction
    pub idle: Duration,
}

/// Counters exposed by [`IpcManager::statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_transferred: u64,
    pub connections_failed: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_transferred: AtomicU64,
    connections_failed: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ManagerStatistics {
        ManagerStatistics {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.messages_sent,
            &self.messages_received,
            &self.bytes_transferred,
            &self.connections_failed,
            &self.reconnect_attempts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

struct Connection {
    id: u64,
    pid: u32,
    pipe: PipeConnection,
    last_activity: Mutex<Instant>,
}

impl Connection {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn is_active(&self) -> bool {
        self.pipe.is_connected()
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            pid: self.pid,
            active: self.is_active(),
            idle: self.last_activity.lock().elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// Every connection (server) or the server (client)
    All,
    Pid(u32),
    Connection(u64),
}

impl Target {
    fn selects(self, connection: &Connection) -> bool {
        match self {
            Self::All => true,
            Self::Pid(pid) => connection.pid == pid,
            Self::Connection(id) => connection.id == id,
        }
    }
}

struct Outgoing {
    message: IpcMessage,
    target: Target,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionHandler>,
    error: Option<ErrorHandler>,
}

struct Inner {
    config: IpcConfig,
    running: AtomicBool,
    state: StateCell,
    connections: RwLock<Vec<Arc<Connection>>>,
    next_connection: AtomicU64,
    next_frame: AtomicU64,
    queue: Mutex<VecDeque<Outgoing>>,
    queue_ready: Condvar,
    pending: Correlator<String, Option<String>>,
    origins: Mutex<HashMap<String, u64>>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    callbacks: RwLock<Callbacks>,
    ids: MessageIds,
    stats: Counters,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn is_server(&self) -> bool {
        self.config.role == IpcRole::Server
    }

    fn notify_error(&self, error: &RenderwardError) {
        let callback = self.callbacks.read().error.clone();
        if let Some(cb) = callback {
            guarded("on_error", || cb(error));
        }
    }

    fn notify_connection(&self, pid: u32, connected: bool) {
        let callback = self.callbacks.read().connection.clone();
        if let Some(cb) = callback {
            guarded("on_connection", || cb(pid, connected));
        }
    }

    fn active_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    fn has_recipient(&self, target: Target) -> bool {
        self.active_connections().iter().any(|c| target.selects(c))
    }

    fn enqueue(&self, message: IpcMessage, target: Target) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        if !self.has_recipient(target) {
            tracing::debug!(channel = %message.channel, ?target, "no recipient for message");
            return false;
        }
        self.queue.lock().push_back(Outgoing { message, target });
        self.queue_ready.notify_one();
        true
    }

    fn write(&self, connection: &Connection, bytes: &[u8]) -> bool {
        let frame_id = self.next_frame.fetch_add(1, Ordering::Relaxed);
        match connection.pipe.send_frame(FrameKind::Message, frame_id, bytes) {
            Ok(written) => {
                connection.touch();
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_transferred
                    .fetch_add(written as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(pid = connection.pid, error = %e, "message send failed");
                self.notify_error(&e);
                false
            }
        }
    }

    fn deliver(&self, outgoing: &Outgoing) {
        let bytes = match outgoing.message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.notify_error(&e);
                return;
            }
        };
        let mut delivered = 0usize;
        for connection in self.active_connections() {
            if outgoing.target.selects(&connection) && self.write(&connection, &bytes) {
                delivered += 1;
            }
        }
        tracing::trace!(
            channel = %outgoing.message.channel,
            id = %outgoing.message.message_id,
            delivered,
            "message delivered"
        );
    }

    fn sender_loop(self: Arc<Self>) {
        tracing::debug!("manager sender started");
        loop {
            let next = {
                let mut queue = self.queue.lock();
                while queue.is_empty() && self.running.load(Ordering::Acquire) {
                    self.queue_ready.wait_for(&mut queue, QUEUE_WAIT);
                }
                if !self.running.load(Ordering::Acquire) {
                    break;
                }
                queue.pop_front()
            };
            if let Some(outgoing) = next {
                self.deliver(&outgoing);
            }
        }
        tracing::debug!("manager sender stopped");
    }

    fn dispatch(&self, message: IpcMessage, origin: u64) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        if message.kind == MessageKind::Response {
            if self
                .pending
                .fulfill(&message.message_id, Some(message.payload))
                .is_none()
            {
                tracing::debug!(id = %message.message_id, "response without a waiting request");
            }
            return;
        }

        if message.kind == MessageKind::Request && self.is_server() {
            self.origins.lock().insert(message.message_id.clone(), origin);
        }

        let handler = self.handlers.read().get(&message.channel).cloned();
        let Some(handler) = handler else {
            tracing::debug!(channel = %message.channel, "no handler for channel");
            return;
        };
        let mut reply = None;
        guarded("message handler", || reply = handler(&message));

        if message.kind == MessageKind::Request {
            if let Some(payload) = reply {
                self.respond(&message.message_id, payload);
            }
        }
    }

    fn respond(&self, message_id: &str, payload: String) {
        let origin = self.origins.lock().remove(message_id);
        let target = origin.map_or(Target::All, Target::Connection);
        let message = IpcMessage::new(RESPONSE_CHANNEL, MessageKind::Response, message_id, payload);
        if !self.enqueue(message, target) {
            tracing::debug!(id = message_id, "response origin gone");
        }
    }

    /// Read frames from `connection` until it closes or the manager stops
    fn read_loop(&self, connection: &Connection) {
        while self.running.load(Ordering::Acquire) && connection.is_active() {
            match connection.pipe.receive_frame(READ_SLICE) {
                Ok(Some(frame)) => {
                    connection.touch();
                    self.stats
                        .bytes_transferred
                        .fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
                    if frame.kind != FrameKind::Message {
                        continue;
                    }
                    match IpcMessage::from_bytes(&frame.payload) {
                        Ok(message) => self.dispatch(message, connection.id),
                        Err(e) => {
                            tracing::warn!(pid = connection.pid, error = %e, "undecodable message");
                            self.notify_error(&e);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(pid = connection.pid, error = %e, "connection closed");
                    break;
                }
            }
        }
        connection.pipe.close();
    }

    fn add_connection(&self, pipe: PipeConnection) -> Arc<Connection> {
        let connection = Arc::new(Connection {
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            pid: pipe.peer_pid().unwrap_or(0),
            pipe,
            last_activity: Mutex::new(Instant::now()),
        });
        self.connections.write().push(Arc::clone(&connection));
        self.state.set(ConnectionState::Connected);
        connection
    }

    fn remove_connection(&self, connection: &Connection) {
        let remaining = {
            let mut connections = self.connections.write();
            connections.retain(|c| c.id != connection.id);
            connections.len()
        };
        self.origins.lock().retain(|_, origin| *origin != connection.id);
        if remaining == 0 {
            self.state.set(ConnectionState::Disconnected);
        }
    }

    fn listener_loop(self: Arc<Self>, listener: PipeListener) {
        tracing::info!(pipe = listener.name(), "manager listening");
        while self.running.load(Ordering::Acquire) {
            let pipe = match listener.accept(ACCEPT_SLICE) {
                Ok(Some(pipe)) => pipe,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    self.stats.connections_failed.fetch_add(1, Ordering::Relaxed);
                    self.notify_error(&e);
                    std::thread::sleep(ACCEPT_SLICE);
                    continue;
                }
            };

            if self.active_connections().len() >= self.config.max_connections {
                tracing::warn!(
                    max = self.config.max_connections,
                    peer = ?pipe.peer_pid(),
                    "connection limit reached, rejecting"
                );
                self.stats.connections_failed.fetch_add(1, Ordering::Relaxed);
                pipe.close();
                continue;
            }

            let connection = self.add_connection(pipe);
            tracing::info!(pid = connection.pid, "client connected");
            self.notify_connection(connection.pid, true);

            let inner = Arc::clone(&self);
            let spawned = std::thread::Builder::new()
                .name(format!("renderward-ipc-{}", connection.id))
                .spawn(move || {
                    inner.read_loop(&connection);
                    inner.remove_connection(&connection);
                    tracing::info!(pid = connection.pid, "client disconnected");
                    inner.notify_connection(connection.pid, false);
                });
            match spawned {
                Ok(handle) => {
                    let mut readers = self.readers.lock();
                    readers.retain(|h| !h.is_finished());
                    readers.push(handle);
                }
                Err(e) => self.notify_error(&e.into()),
            }
        }
        tracing::info!("manager listener stopped");
    }

    fn client_loop(self: Arc<Self>) {
        let own_pid = std::process::id();
        let mut attempts = 0u32;
        while self.running.load(Ordering::Acquire) {
            self.state.begin_connect();
            match PipeConnection::connect(
                &self.config.pipe_name,
                self.config.max_message_size,
                self.config.timeout(),
            ) {
                Ok(pipe) => {
                    attempts = 0;
                    let connection = self.add_connection(pipe);
                    tracing::info!(pipe = %self.config.pipe_name, "connected to manager server");
                    self.notify_connection(own_pid, true);

                    self.read_loop(&connection);

                    self.remove_connection(&connection);
                    tracing::info!(pipe = %self.config.pipe_name, "disconnected from manager server");
                    self.notify_connection(own_pid, false);

                    if !self.config.enable_reconnect
                        || !self.sleep_unless_stopped(Duration::from_millis(self.config.reconnect_delay_ms))
                    {
                        break;
                    }
                    self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    attempts += 1;
                    self.state.set(ConnectionState::Disconnected);
                    self.stats.connections_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(attempts, error = %e, "connect failed");

                    if !self.config.enable_reconnect || attempts >= self.config.max_reconnect_attempts {
                        tracing::error!(attempts, "reconnect attempts exhausted");
                        self.notify_error(&RenderwardError::ReconnectExhausted(attempts));
                        break;
                    }
                    tracing::warn!(attempts, delay_ms = self.config.reconnect_delay_ms, "reconnecting");
                    if !self.sleep_unless_stopped(Duration::from_millis(self.config.reconnect_delay_ms)) {
                        break;
                    }
                    self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        tracing::debug!("manager client loop stopped");
    }

    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while self.running.load(Ordering::Acquire) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(QUEUE_WAIT));
        }
        false
    }
}

/// Channel-routed messaging between one server and many clients
pub struct IpcManager {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl IpcManager {
    #[must_use]
    pub fn new(config: IpcConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                running: AtomicBool::new(false),
                state: StateCell::new(ConnectionState::Disconnected),
                connections: RwLock::new(Vec::new()),
                next_connection: AtomicU64::new(1),
                next_frame: AtomicU64::new(1),
                queue: Mutex::new(VecDeque::new()),
                queue_ready: Condvar::new(),
                pending: Correlator::new(),
                origins: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(Callbacks::default()),
                ids: MessageIds::new(),
                stats: Counters::default(),
                readers: Mutex::new(Vec::new()),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start listening (server) or connecting (client)
    ///
    /// A server fails here when the pipe cannot be created. A client
    /// connects in the background; see [`wait_connected`](Self::wait_connected).
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let config = &self.inner.config;
        let mut threads = self.threads.lock();

        let role_thread = if self.inner.is_server() {
            let listener = match PipeListener::bind(&config.pipe_name, config.max_message_size) {
                Ok(listener) => listener,
                Err(e) => {
                    self.inner.running.store(false, Ordering::Release);
                    return Err(e);
                }
            };
            let inner = Arc::clone(&self.inner);
            std::thread::Builder::new()
                .name("renderward-ipc-listen".into())
                .spawn(move || inner.listener_loop(listener))
        } else {
            let inner = Arc::clone(&self.inner);
            std::thread::Builder::new()
                .name("renderward-ipc-client".into())
                .spawn(move || inner.client_loop())
        };
        let sender = {
            let inner = Arc::clone(&self.inner);
            std::thread::Builder::new()
                .name("renderward-ipc-send".into())
                .spawn(move || inner.sender_loop())
        };

        match (role_thread, sender) {
            (Ok(role), Ok(sender)) => {
                threads.push(role);
                threads.push(sender);
            }
            (role, sender) => {
                self.inner.running.store(false, Ordering::Release);
                threads.extend(role.ok());
                threads.extend(sender.ok());
                drop(threads);
                self.join_threads();
                return Err(RenderwardError::ChannelInit("manager threads failed to start".into()));
            }
        }

        tracing::info!(pipe = %config.pipe_name, role = ?config.role, "manager started");
        Ok(())
    }

    /// Stop every thread and close every connection; safe to call repeatedly
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.queue_ready.notify_all();
        for connection in self.inner.connections.read().iter() {
            connection.pipe.close();
        }
        self.join_threads();

        self.inner.connections.write().clear();
        self.inner.queue.lock().clear();
        self.inner.origins.lock().clear();
        self.inner.pending.fail_all(|_| None);
        self.inner.state.set(ConnectionState::Disconnected);
        tracing::info!(pipe = %self.inner.config.pipe_name, "manager stopped");
    }

    fn join_threads(&self) {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let readers: Vec<_> = self.inner.readers.lock().drain(..).collect();
        for handle in threads.into_iter().chain(readers) {
            if handle.join().is_err() {
                tracing::error!("manager thread panicked");
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Poll until connected or `timeout` passes
    #[must_use]
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() == ConnectionState::Connected {
                return true;
            }
            if Instant::now() >= deadline || !self.is_running() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Queue a notification for every peer; false when nobody would get it
    pub fn send(&self, channel: &str, payload: impl Into<String>) -> bool {
        let message = IpcMessage::new(channel, MessageKind::Notification, self.inner.ids.next(), payload);
        self.inner.enqueue(message, Target::All)
    }

    /// Queue a notification for the connection owned by `pid`
    pub fn send_to(&self, pid: u32, channel: &str, payload: impl Into<String>) -> bool {
        let message = IpcMessage::new(channel, MessageKind::Notification, self.inner.ids.next(), payload);
        self.inner.enqueue(message, Target::Pid(pid))
    }

    /// Queue a notification for all active connections
    pub fn broadcast(&self, channel: &str, payload: impl Into<String>) -> bool {
        self.send(channel, payload)
    }

    /// Send a request and wait for its response payload
    ///
    /// `None` on timeout, when no peer is connected, or on shutdown.
    pub fn send_request(&self, channel: &str, payload: impl Into<String>, timeout: Duration) -> Option<String> {
        let id = self.inner.ids.next();
        let handle = self.inner.pending.register(id.clone(), timeout);
        let message = IpcMessage::new(channel, MessageKind::Request, id.clone(), payload);
        if !self.inner.enqueue(message, Target::All) {
            self.inner.pending.cancel(&id);
            return None;
        }
        let reply = handle.wait(&self.inner.pending, timeout).flatten();
        if reply.is_none() {
            tracing::warn!(id = %id, channel, "request timed out");
        }
        reply
    }

    /// Answer request `message_id`, routed back to the connection it came from
    pub fn send_response(&self, message_id: &str, payload: impl Into<String>) {
        self.inner.respond(message_id, payload.into());
    }

    /// Handle requests and notifications on `channel`
    ///
    /// For a request, a returned payload is sent back as the response.
    pub fn register_handler(
        &self,
        channel: impl Into<String>,
        handler: impl Fn(&IpcMessage) -> Option<String> + Send + Sync + 'static,
    ) {
        let channel = channel.into();
        tracing::debug!(channel = %channel, "message handler registered");
        self.inner.handlers.write().insert(channel, Arc::new(handler));
    }

    pub fn on_connection(&self, f: impl Fn(u32, bool) + Send + Sync + 'static) {
        self.inner.callbacks.write().connection = Some(Arc::new(f));
    }

    pub fn on_error(&self, f: impl Fn(&RenderwardError) + Send + Sync + 'static) {
        self.inner.callbacks.write().error = Some(Arc::new(f));
    }

    #[must_use]
    pub fn connected_processes(&self) -> Vec<u32> {
        self.inner.active_connections().iter().map(|c| c.pid).collect()
    }

    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.connections.read().iter().map(|c| c.info()).collect()
    }

    #[must_use]
    pub fn is_connected(&self, pid: u32) -> bool {
        self.inner.has_recipient(Target::Pid(pid))
    }

    /// Close the connection owned by `pid`; its reader thread cleans up
    pub fn disconnect_process(&self, pid: u32) -> bool {
        let mut found = false;
        for connection in self.inner.active_connections() {
            if connection.pid == pid {
                connection.pipe.close();
                found = true;
            }
        }
        found
    }

    #[must_use]
    pub fn statistics(&self) -> ManagerStatistics {
        self.inner.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.inner.stats.reset();
    }

    #[must_use]
    pub fn config(&self) -> &IpcConfig {
        &self.inner.config
    }
}

impl Drop for IpcManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::tests::pipe_name;
    use std::sync::atomic::AtomicUsize;

    fn server(tag: &str) -> (IpcManager, String) {
        let name = pipe_name(tag);
        let server = IpcManager::new(IpcConfig::server(name.clone()));
        server.start().unwrap();
        (server, name)
    }

    fn client(name: &str) -> IpcManager {
        let client = IpcManager::new(IpcConfig {
            reconnect_delay_ms: 20,
            ..IpcConfig::client(name)
        });
        client.start().unwrap();
        assert!(client.wait_connected(Duration::from_secs(3)));
        client
    }

    fn wait_for(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn request_gets_handler_response() {
        let (server, name) = server("request");
        server.register_handler("upper", |m| Some(m.payload.to_uppercase()));
        let client = client(&name);
        assert!(wait_for(|| server.state() == ConnectionState::Connected));

        let reply = client.send_request("upper", "hello", Duration::from_secs(3));
        assert_eq!(reply.as_deref(), Some("HELLO"));
        assert!(server.statistics().messages_received >= 1);
        assert!(client.statistics().messages_sent >= 1);
    }

    #[test]
    fn notifications_reach_channel_handlers() {
        let (server, name) = server("notify");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        server.register_handler("status", move |m| {
            s.lock().push(m.payload.clone());
            None
        });
        let client = client(&name);

        assert!(client.send("status", "ready"));
        assert!(client.send("ignored", "nobody listens"));
        assert!(wait_for(|| seen.lock().len() == 1));
        assert_eq!(seen.lock()[0], "ready");
    }

    #[test]
    fn unanswered_request_times_out() {
        let (server, name) = server("timeout");
        server.register_handler("slow", |_| None);
        let client = client(&name);
        assert!(wait_for(|| !server.connected_processes().is_empty()));

        let started = Instant::now();
        assert_eq!(client.send_request("slow", "x", Duration::from_millis(150)), None);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(client.inner.pending.is_empty());
    }

    #[test]
    fn send_to_targets_one_pid() {
        let (server, name) = server("sendto");
        let client = client(&name);
        let got = Arc::new(AtomicUsize::new(0));
        let g = Arc::clone(&got);
        client.register_handler("direct", move |_| {
            g.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert!(wait_for(|| server.is_connected(std::process::id())));

        assert!(!server.send_to(u32::MAX, "direct", "lost"));
        assert!(server.send_to(std::process::id(), "direct", "found"));
        assert!(wait_for(|| got.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn response_goes_only_to_the_requester() {
        let (server, name) = server("routing");
        let request_ids = Arc::new(Mutex::new(Vec::new()));
        let ids = Arc::clone(&request_ids);
        server.register_handler("deferred", move |m| {
            ids.lock().push(m.message_id.clone());
            None
        });

        let requester = Arc::new(client(&name));
        let bystander = client(&name);
        assert!(wait_for(|| server.connections().len() == 2));

        let r = Arc::clone(&requester);
        let waiter = std::thread::spawn(move || {
            r.send_request("deferred", "work", Duration::from_secs(3))
        });
        assert!(wait_for(|| !request_ids.lock().is_empty()));
        let id = request_ids.lock()[0].clone();
        server.send_response(&id, "done");

        assert_eq!(waiter.join().unwrap().as_deref(), Some("done"));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(bystander.statistics().messages_received, 0);
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let (server, name) = server("broadcast");
        let count = Arc::new(AtomicUsize::new(0));
        let clients: Vec<_> = (0..3)
            .map(|_| {
                let c = client(&name);
                let n = Arc::clone(&count);
                c.register_handler("all", move |_| {
                    n.fetch_add(1, Ordering::SeqCst);
                    None
                });
                c
            })
            .collect();
        assert!(wait_for(|| server.connections().len() == 3));

        assert!(server.broadcast("all", "hi"));
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 3));
        drop(clients);
        assert!(wait_for(|| server.connections().is_empty()));
        assert_eq!(server.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connection_limit_is_enforced() {
        let name = pipe_name("limit");
        let server = IpcManager::new(IpcConfig {
            max_connections: 1,
            ..IpcConfig::server(name.clone())
        });
        server.start().unwrap();
        let _first = client(&name);
        assert!(wait_for(|| server.connections().len() == 1));

        let second = IpcManager::new(IpcConfig::client(name));
        second.start().unwrap();
        assert!(wait_for(|| server.statistics().connections_failed >= 1));
        assert_eq!(server.connections().len(), 1);
    }

    #[test]
    fn client_reports_reconnect_exhaustion() {
        let name = pipe_name("absent");
        let client = IpcManager::new(IpcConfig {
            max_reconnect_attempts: 2,
            reconnect_delay_ms: 10,
            timeout_ms: 50,
            ..IpcConfig::client(name)
        });
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        client.on_error(move |err| e.lock().push(err.to_string()));
        client.start().unwrap();

        assert!(wait_for(|| !errors.lock().is_empty()));
        assert!(errors.lock()[0].contains("reconnect attempts exhausted after 2"));
        assert!(!client.wait_connected(Duration::from_millis(50)));
        assert_eq!(client.statistics().connections_failed, 2);
        assert_eq!(client.statistics().reconnect_attempts, 1);
    }

    #[test]
    fn disconnect_and_stop_are_safe() {
        let (server, name) = server("disconnect");
        let events = Arc::new(Mutex::new(Vec::new()));
        let ev = Arc::clone(&events);
        server.on_connection(move |pid, connected| ev.lock().push((pid, connected)));
        let _client = client(&name);
        assert!(wait_for(|| server.is_connected(std::process::id())));

        assert!(server.disconnect_process(std::process::id()));
        assert!(wait_for(|| events.lock().len() == 2));
        assert_eq!(events.lock()[1], (std::process::id(), false));

        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert!(!server.send("any", "x"));
    }
}
