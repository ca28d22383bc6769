//! Framed named-pipe transport
//!
//! [`PipeConnection`] moves whole frames over one connected stream.
//! [`NamedPipeChannel`] wraps it as a [`TransportChannel`] with the server
//! side able to re-accept after the renderer reconnects.

use crate::os::pipe::{RawListener, RawStream};
use crate::protocol::{decode_command, decode_result, encode_command, encode_result, now_millis};
use crate::transport::frame::{self, Frame, FrameDecoder, FrameKind};
use crate::transport::{
    ChannelStats, ConnectionState, StatCounters, StateCell, TransportChannel, TransportKind,
};
use crate::{RenderCommand, RenderResult, RenderwardError, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 64 * 1024;

/// How long a frame write may stall on a peer that is not reading
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// One connected pipe carrying frames
pub struct PipeConnection {
    stream: RawStream,
    decoder: Mutex<FrameDecoder>,
    write_lock: Mutex<()>,
    max_message: usize,
    connected: AtomicBool,
}

impl PipeConnection {
    fn new(stream: RawStream, max_message: usize) -> Self {
        Self {
            stream,
            decoder: Mutex::new(FrameDecoder::new(max_message)),
            write_lock: Mutex::new(()),
            max_message,
            connected: AtomicBool::new(true),
        }
    }

    /// Connect as a client to the pipe `name`
    pub fn connect(name: &str, max_message: usize, timeout: Duration) -> Result<Self> {
        let stream = RawStream::connect(name, timeout)?;
        tracing::debug!(pipe = name, "pipe connected");
        Ok(Self::new(stream, max_message))
    }

    /// Write one frame; returns the bytes put on the wire
    pub fn send_frame(&self, kind: FrameKind, message_id: u64, payload: &[u8]) -> Result<usize> {
        self.send_frame_within(kind, message_id, payload, DEFAULT_WRITE_TIMEOUT)
    }

    /// Write one frame within `timeout`, including any wait behind other
    /// writers
    ///
    /// A write that runs out of time closes the connection: part of the
    /// frame may already be on the wire.
    pub fn send_frame_within(
        &self,
        kind: FrameKind,
        message_id: u64,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        if !self.is_connected() {
            return Err(RenderwardError::NotConnected);
        }
        let deadline = Instant::now() + timeout;
        let bytes = frame::encode(kind, message_id, payload, self.max_message)?;
        let Some(_guard) = self.write_lock.try_lock_for(timeout) else {
            return Err(RenderwardError::ChannelBusy("pipe writer"));
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            // Nothing written yet, so the stream is still in sync.
            return Err(RenderwardError::ChannelBusy("pipe writer"));
        }
        self.stream.write_all(&bytes, remaining).map_err(|e| match e {
            RenderwardError::WriteTimeout(_) => {
                tracing::warn!(len = bytes.len(), ?timeout, "pipe write stalled, closing");
                self.close();
                RenderwardError::WriteTimeout(timeout)
            }
            RenderwardError::NotConnected => {
                self.connected.store(false, Ordering::Release);
                e
            }
            other => other,
        })?;
        Ok(bytes.len())
    }

    /// Next whole frame, waiting up to `timeout`
    ///
    /// A malformed stream or a closed peer marks the connection dead.
    pub fn receive_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        if !self.is_connected() {
            return Err(RenderwardError::NotConnected);
        }
        let deadline = Instant::now() + timeout;
        let mut decoder = self.decoder.lock();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match decoder.decode() {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) => {
                    decoder.clear();
                    self.connected.store(false, Ordering::Release);
                    return Err(e);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.stream.read_available(&mut buf, remaining) {
                Ok(0) => {}
                Ok(n) => decoder.push(&buf[..n]),
                Err(e) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peer_pid(&self) -> Option<u32> {
        self.stream.peer_pid()
    }

    #[must_use]
    pub const fn max_message(&self) -> usize {
        self.max_message
    }

    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.stream.shutdown();
        }
    }
}

impl Drop for PipeConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Server end that hands out [`PipeConnection`]s
pub struct PipeListener {
    raw: RawListener,
    name: String,
    max_message: usize,
}

impl PipeListener {
    pub fn bind(name: &str, max_message: usize) -> Result<Self> {
        let raw = RawListener::bind(name)?;
        tracing::debug!(pipe = name, "pipe listening");
        Ok(Self {
            raw,
            name: name.to_string(),
            max_message,
        })
    }

    /// `Ok(None)` when nobody connected within `timeout`
    pub fn accept(&self, timeout: Duration) -> Result<Option<PipeConnection>> {
        Ok(self
            .raw
            .accept(timeout)?
            .map(|stream| PipeConnection::new(stream, self.max_message)))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Render command/result transport over a named pipe
pub struct NamedPipeChannel {
    name: String,
    max_message: usize,
    listener: Option<PipeListener>,
    connection: RwLock<Option<Arc<PipeConnection>>>,
    state: StateCell,
    stats: StatCounters,
    next_id: AtomicU64,
}

impl NamedPipeChannel {
    /// Listen on `name`; call [`accept`](Self::accept) to take the renderer
    pub fn create_server(name: &str, max_message: usize) -> Result<Self> {
        let listener = PipeListener::bind(name, max_message)?;
        tracing::info!(pipe = name, max_message, "render pipe created");
        Ok(Self {
            name: name.to_string(),
            max_message,
            listener: Some(listener),
            connection: RwLock::new(None),
            state: StateCell::new(ConnectionState::Disconnected),
            stats: StatCounters::default(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Connect to a server created by the parent
    pub fn connect(name: &str, max_message: usize, timeout: Duration) -> Result<Self> {
        let channel = Self {
            name: name.to_string(),
            max_message,
            listener: None,
            connection: RwLock::new(None),
            state: StateCell::new(ConnectionState::Connecting),
            stats: StatCounters::default(),
            next_id: AtomicU64::new(1),
        };
        channel.stats.connection_attempt();
        match PipeConnection::connect(name, max_message, timeout) {
            Ok(conn) => {
                channel.install(conn);
                Ok(channel)
            }
            Err(e) => {
                channel.stats.error();
                channel.state.set(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn install(&self, conn: PipeConnection) {
        tracing::info!(pipe = %self.name, peer = ?conn.peer_pid(), "render pipe connected");
        *self.connection.write() = Some(Arc::new(conn));
        self.state.set(ConnectionState::Connected);
        self.stats.touch();
    }

    /// Wait up to `timeout` for a client; `Ok(true)` once connected
    ///
    /// Does nothing on the client side or while already connected.
    pub fn accept(&self, timeout: Duration) -> Result<bool> {
        let Some(listener) = &self.listener else {
            return Ok(self.is_connected());
        };
        if self.is_connected() {
            return Ok(true);
        }
        if !self.state.begin_connect() {
            return Ok(false);
        }
        self.stats.connection_attempt();
        match listener.accept(timeout) {
            Ok(Some(conn)) => {
                self.install(conn);
                Ok(true)
            }
            Ok(None) => {
                self.state.set(ConnectionState::Disconnected);
                Ok(false)
            }
            Err(e) => {
                self.stats.error();
                self.state.set(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Probe the link with a heartbeat frame
    pub fn test_connection(&self) -> bool {
        self.send(FrameKind::Heartbeat, &[], DEFAULT_WRITE_TIMEOUT).is_ok()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn peer_pid(&self) -> Option<u32> {
        self.current().and_then(|c| c.peer_pid())
    }

    fn current(&self) -> Option<Arc<PipeConnection>> {
        self.connection.read().clone()
    }

    fn mark_disconnected(&self, reason: &RenderwardError) {
        let dropped = self.connection.write().take();
        if let Some(conn) = dropped {
            conn.close();
            self.state.set(ConnectionState::Disconnected);
            self.stats.disconnection();
            tracing::warn!(pipe = %self.name, error = %reason, "render pipe disconnected");
        }
    }

    fn send(&self, kind: FrameKind, payload: &[u8], timeout: Duration) -> Result<()> {
        if payload.len() > self.max_message {
            self.stats.error();
            return Err(RenderwardError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message,
            });
        }
        let conn = self.current().ok_or(RenderwardError::NotConnected)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match conn.send_frame_within(kind, id, payload, timeout) {
            Ok(written) => {
                self.stats.sent(written);
                Ok(())
            }
            Err(e @ (RenderwardError::MessageTooLarge { .. } | RenderwardError::ChannelBusy(_))) => {
                self.stats.error();
                Err(e)
            }
            Err(e @ RenderwardError::WriteTimeout(_)) => {
                self.stats.timeout();
                self.mark_disconnected(&e);
                Err(e)
            }
            Err(e) => {
                self.stats.error();
                self.mark_disconnected(&e);
                Err(e)
            }
        }
    }

    /// Next non-heartbeat frame payload of kind `expected`
    fn receive(&self, expected: FrameKind, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let conn = self.current().ok_or(RenderwardError::NotConnected)?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match conn.receive_frame(remaining) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.stats.error();
                    self.mark_disconnected(&e);
                    return Err(e);
                }
            };
            self.stats.received(frame::HEADER_SIZE + frame.payload.len());

            if frame.kind == FrameKind::Heartbeat {
                if remaining.is_zero() {
                    return Ok(None);
                }
                continue;
            }
            if frame.kind != expected {
                self.stats.error();
                return Err(RenderwardError::Protocol(format!(
                    "expected {expected:?} frame, got {:?}",
                    frame.kind
                )));
            }
            tracing::trace!(
                pipe = %self.name,
                id = frame.message_id,
                age_ms = now_millis().saturating_sub(frame.timestamp),
                "frame received"
            );
            return Ok(Some(frame.payload));
        }
    }
}

impl TransportChannel for NamedPipeChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::NamedPipe
    }

    fn send_command(&self, command: &RenderCommand) -> Result<()> {
        self.send_command_within(command, DEFAULT_WRITE_TIMEOUT)
    }

    fn send_command_within(&self, command: &RenderCommand, budget: Duration) -> Result<()> {
        self.send(FrameKind::Command, &encode_command(command)?, budget)
    }

    fn receive_command(&self, timeout: Duration) -> Result<Option<RenderCommand>> {
        self.receive(FrameKind::Command, timeout)?
            .map(|bytes| decode_command(&bytes))
            .transpose()
    }

    fn send_result(&self, result: &RenderResult) -> Result<()> {
        self.send(FrameKind::Result, &encode_result(result)?, DEFAULT_WRITE_TIMEOUT)
    }

    fn receive_result(&self, timeout: Duration) -> Result<Option<RenderResult>> {
        self.receive(FrameKind::Result, timeout)?
            .map(|bytes| decode_result(&bytes))
            .transpose()
    }

    fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
            && self.current().is_some_and(|c| c.is_connected())
    }

    fn statistics(&self) -> ChannelStats {
        self.stats.snapshot()
    }

    fn reset_statistics(&self) {
        self.stats.reset();
    }

    fn cleanup(&self) {
        if let Some(conn) = self.connection.write().take() {
            conn.close();
        }
        self.state.set(ConnectionState::Disconnected);
    }
}

impl Drop for NamedPipeChannel {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{CommandType, ContentParameters, ResultStatus};
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn pipe_name(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "rw_pipe_{tag}_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn pair(tag: &str, max: usize) -> (NamedPipeChannel, NamedPipeChannel) {
        let name = pipe_name(tag);
        let server = NamedPipeChannel::create_server(&name, max).unwrap();
        let client_name = name.clone();
        let client = std::thread::spawn(move || {
            NamedPipeChannel::connect(&client_name, max, Duration::from_secs(2)).unwrap()
        });
        assert!(server.accept(Duration::from_secs(2)).unwrap());
        (server, client.join().unwrap())
    }

    #[test]
    fn command_and_result_roundtrip() {
        let (server, client) = pair("roundtrip", 1 << 20);
        assert!(server.is_connected());
        assert!(client.is_connected());

        let mut command = RenderCommand::new(CommandType::Resize, 3);
        command.command_id = 42;
        server.send_command(&command).unwrap();
        let got = client
            .receive_command(Duration::from_secs(1))
            .unwrap()
            .expect("command");
        assert_eq!(got, command);

        client
            .send_result(&RenderResult::success(42, 3).with_render_time(1.5))
            .unwrap();
        let result = server
            .receive_result(Duration::from_secs(1))
            .unwrap()
            .expect("result");
        assert_eq!(result.status, ResultStatus::Success);
        assert!((result.render_time_ms - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn heartbeats_are_invisible_to_readers() {
        let (server, client) = pair("heartbeat", 1 << 20);
        assert!(server.test_connection());
        assert!(server.test_connection());
        server
            .send_command(&RenderCommand::new(CommandType::Render, 1))
            .unwrap();

        let got = client.receive_command(Duration::from_secs(1)).unwrap();
        assert_eq!(got.map(|c| c.command_type), Some(CommandType::Render));
        assert!(client.receive_command(Duration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn oversized_message_is_refused_but_link_survives() {
        let (server, client) = pair("oversize", 1024);
        let command = RenderCommand::new(CommandType::UpdateContent, 9).with_content(ContentParameters {
            source_url: "y".repeat(4096),
            ..ContentParameters::default()
        });
        assert!(matches!(
            server.send_command(&command),
            Err(RenderwardError::MessageTooLarge { .. })
        ));
        assert!(server.is_connected());

        server
            .send_command(&RenderCommand::new(CommandType::Render, 9))
            .unwrap();
        assert!(client.receive_command(Duration::from_secs(1)).unwrap().is_some());
    }

    #[test]
    fn oversized_message_is_refused_before_any_peer_connects() {
        let server = NamedPipeChannel::create_server(&pipe_name("early"), 1024).unwrap();
        let command = RenderCommand::new(CommandType::UpdateContent, 2).with_content(ContentParameters {
            source_url: "w".repeat(2048),
            ..ContentParameters::default()
        });
        assert!(matches!(
            server.send_command(&command),
            Err(RenderwardError::MessageTooLarge { max: 1024, .. })
        ));
        assert!(matches!(
            server.send_command(&RenderCommand::new(CommandType::Render, 2)),
            Err(RenderwardError::NotConnected)
        ));
        assert_eq!(server.statistics().errors, 1);
    }

    #[test]
    fn stalled_reader_cannot_hold_a_writer_past_its_budget() {
        let (server, _client) = pair("stalled", 4 << 20);
        let command = RenderCommand::new(CommandType::UpdateContent, 4).with_content(ContentParameters {
            source_url: "z".repeat(1 << 20),
            ..ContentParameters::default()
        });
        let budget = Duration::from_millis(200);

        let mut timed_out = false;
        for _ in 0..4 {
            let started = Instant::now();
            let sent = server.send_command_within(&command, budget);
            assert!(started.elapsed() < budget + Duration::from_secs(1));
            if let Err(e) = sent {
                assert!(matches!(e, RenderwardError::WriteTimeout(_)), "{e}");
                timed_out = true;
                break;
            }
        }
        assert!(timed_out);
        assert!(!server.is_connected());
        assert_eq!(server.statistics().timeouts, 1);
        assert!(matches!(
            server.send_command_within(&command, budget),
            Err(RenderwardError::NotConnected)
        ));
    }

    #[test]
    fn exhausted_budget_writes_nothing_and_keeps_the_link() {
        let (server, client) = pair("nobudget", 1 << 20);
        let command = RenderCommand::new(CommandType::Render, 6);
        assert!(matches!(
            server.send_command_within(&command, Duration::ZERO),
            Err(RenderwardError::ChannelBusy(_))
        ));
        assert!(server.is_connected());

        server.send_command(&command).unwrap();
        let got = client.receive_command(Duration::from_secs(1)).unwrap();
        assert_eq!(got.map(|c| c.widget_id), Some(6));
    }

    #[test]
    fn peer_loss_marks_channel_disconnected() {
        let (server, client) = pair("loss", 1 << 20);
        drop(client);
        let err = server.receive_result(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RenderwardError::NotConnected));
        assert!(!server.is_connected());
        assert_eq!(server.state(), ConnectionState::Disconnected);
        assert_eq!(server.statistics().disconnections, 1);
    }

    #[test]
    fn server_accepts_again_after_disconnect() {
        let name = pipe_name("reaccept");
        let server = NamedPipeChannel::create_server(&name, 4096).unwrap();
        assert!(!server.accept(Duration::from_millis(20)).unwrap());

        for _ in 0..2 {
            let n = name.clone();
            let client = std::thread::spawn(move || {
                NamedPipeChannel::connect(&n, 4096, Duration::from_secs(2)).unwrap()
            });
            assert!(server.accept(Duration::from_secs(2)).unwrap());
            let client = client.join().unwrap();
            client.send_result(&RenderResult::success(1, 1)).unwrap();
            assert!(server.receive_result(Duration::from_secs(1)).unwrap().is_some());
            drop(client);
            let _ = server.receive_result(Duration::from_secs(1));
            assert!(!server.is_connected());
        }
    }

    #[test]
    fn connect_without_server_fails() {
        let err = NamedPipeChannel::connect(&pipe_name("absent"), 4096, Duration::from_millis(100));
        assert!(matches!(err, Err(RenderwardError::ChannelInit(_))));
    }
}
