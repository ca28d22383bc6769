//! Transport channels between the parent and the renderer
//!
//! Two implementations share one trait:
//! - [`SharedMemoryChannel`](crate::shm::SharedMemoryChannel) for low latency
//! - [`NamedPipeChannel`](crate::pipe::NamedPipeChannel) for reliability

pub mod frame;

use crate::{RenderCommand, RenderResult, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

/// Which transport a channel is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    SharedMemory,
    NamedPipe,
}

/// Connection lifecycle shared by every transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Atomic holder for a [`ConnectionState`]
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[must_use]
    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `Connecting` only from `Disconnected`
    pub fn begin_connect(&self) -> bool {
        self.0
            .compare_exchange(
                ConnectionState::Disconnected as u8,
                ConnectionState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Snapshot of a channel's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub connection_attempts: u64,
    pub disconnections: u64,
    /// Milliseconds since the epoch of the last successful send or receive
    pub last_activity: u64,
}

/// Live counters behind [`ChannelStats`]
#[derive(Debug, Default)]
pub struct StatCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    connection_attempts: AtomicU64,
    disconnections: AtomicU64,
    last_activity: AtomicU64,
}

impl StatCounters {
    pub fn sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn disconnection(&self) {
        self.disconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity
            .store(crate::protocol::now_millis(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            disconnections: self.disconnections.load(Ordering::Relaxed),
            last_activity: self.last_activity.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.bytes_sent,
            &self.bytes_received,
            &self.messages_sent,
            &self.messages_received,
            &self.timeouts,
            &self.errors,
            &self.connection_attempts,
            &self.disconnections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// One duplex path for commands and results
///
/// The parent sends commands and receives results; the child does the
/// reverse. Receives block for at most `timeout` and return `Ok(None)` when
/// nothing arrived.
pub trait TransportChannel: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn send_command(&self, command: &RenderCommand) -> Result<()>;

    /// Like [`send_command`](Self::send_command) but gives up once `budget`
    /// has passed, whatever the peer is doing
    fn send_command_within(&self, command: &RenderCommand, budget: Duration) -> Result<()>;

    fn receive_command(&self, timeout: Duration) -> Result<Option<RenderCommand>>;

    fn send_result(&self, result: &RenderResult) -> Result<()>;

    fn receive_result(&self, timeout: Duration) -> Result<Option<RenderResult>>;

    fn is_connected(&self) -> bool;

    fn statistics(&self) -> ChannelStats;

    fn reset_statistics(&self);

    /// Release OS resources; later calls are no-ops
    fn cleanup(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_only_starts_from_disconnected() {
        let cell = StateCell::new(ConnectionState::Disconnected);
        assert!(cell.begin_connect());
        assert_eq!(cell.get(), ConnectionState::Connecting);
        assert!(!cell.begin_connect());
        cell.set(ConnectionState::Connected);
        assert!(!cell.begin_connect());
        cell.set(ConnectionState::Disconnected);
        assert!(cell.begin_connect());
    }

    #[test]
    fn counters_snapshot_and_reset() {
        let stats = StatCounters::default();
        stats.sent(10);
        stats.sent(5);
        stats.received(7);
        stats.timeout();
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_received, 7);
        assert_eq!(snap.timeouts, 1);
        assert!(snap.last_activity > 0);

        stats.reset();
        assert_eq!(stats.snapshot().messages_sent, 0);
    }
}
