//! Shared-memory channel
//!
//! Layout of the named region:
//!
//! ```text
//! +-------------------+------------------------+------------------------+
//! | header (64 bytes) | command slot           | result slot            |
//! +-------------------+------------------------+------------------------+
//! ```
//!
//! Each slot holds one message. A writer waits briefly for the slot's ready
//! flag to clear, copies the payload, bumps the sequence, raises the flag and
//! signals the slot's event, all while holding the region mutex. A reader
//! waits on the event, then takes the mutex, validates the header, copies the
//! payload out and clears the flag.
//!
//! The header also records the pid holding the mutex, so a process that
//! crashes mid-write does not wedge the region for everyone after it.

use crate::config::{MAX_SHARED_MEMORY_SIZE, MIN_SHARED_MEMORY_SIZE};
use crate::os::{Mapping, NamedEvent, NamedLock, NamedLockGuard};
use crate::protocol::{decode_command, decode_result, encode_command, encode_result};
use crate::transport::{
    ChannelStats, ConnectionState, StatCounters, StateCell, TransportChannel, TransportKind,
};
use crate::{RenderCommand, RenderResult, RenderwardError, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// "RWSH"
pub const SHM_MAGIC: u32 = 0x5257_5348;
pub const SHM_VERSION: u32 = 2;

/// Bytes reserved for the header
pub const HEADER_AREA: usize = 64;

/// How long a read or write waits for the region mutex
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(5000);

const SLOT_RETRY: Duration = Duration::from_millis(1);

/// Between slices of a mutex wait the holder is checked for liveness
const LOCK_SLICE: Duration = Duration::from_millis(20);

#[repr(C)]
struct SharedHeader {
    magic: AtomicU32,
    version: AtomicU32,
    total_size: AtomicU64,
    command_size: AtomicU64,
    result_size: AtomicU64,
    command_ready: AtomicU32,
    result_ready: AtomicU32,
    command_sequence: AtomicU64,
    result_sequence: AtomicU64,
    /// Pid of the process holding the region mutex, 0 when free
    lock_owner: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<SharedHeader>() <= HEADER_AREA);

/// Which half of the data area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Command,
    Result,
}

impl Slot {
    const fn label(self) -> &'static str {
        match self {
            Self::Command => "command slot",
            Self::Result => "result slot",
        }
    }
}

/// Observable state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    pub ready: bool,
    pub size: u64,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

struct Region {
    mapping: Mapping,
    command_event: NamedEvent,
    result_event: NamedEvent,
    lock: NamedLock,
    slot_capacity: usize,
}

impl Region {
    fn header(&self) -> &SharedHeader {
        // SAFETY: the mapping is at least HEADER_AREA bytes, page aligned, and
        // the header is only accessed through atomics.
        unsafe { &*self.mapping.as_ptr().cast::<SharedHeader>() }
    }

    fn slot_ptr(&self, slot: Slot) -> *mut u8 {
        let offset = match slot {
            Slot::Command => HEADER_AREA,
            Slot::Result => HEADER_AREA + self.slot_capacity,
        };
        // SAFETY: offset + slot_capacity <= mapping length by construction.
        unsafe { self.mapping.as_ptr().add(offset) }
    }

    fn fields(&self, slot: Slot) -> (&AtomicU32, &AtomicU64, &AtomicU64) {
        let h = self.header();
        match slot {
            Slot::Command => (&h.command_ready, &h.command_size, &h.command_sequence),
            Slot::Result => (&h.result_ready, &h.result_size, &h.result_sequence),
        }
    }

    const fn event(&self, slot: Slot) -> &NamedEvent {
        match slot {
            Slot::Command => &self.command_event,
            Slot::Result => &self.result_event,
        }
    }

    /// Take the region mutex within `timeout`, adopting it from a holder
    /// that died with it
    fn lock(&self, timeout: Duration) -> Result<Option<RegionLock<'_>>> {
        let deadline = Instant::now() + timeout;
        let owner = &self.header().lock_owner;
        loop {
            let slice = deadline.saturating_duration_since(Instant::now()).min(LOCK_SLICE);
            let guard = match self.lock.acquire(slice)? {
                Some(guard) => Some(guard),
                None => self.lock.recover(owner),
            };
            if let Some(guard) = guard {
                owner.store(std::process::id(), Ordering::Release);
                return Ok(Some(RegionLock { owner, _guard: guard }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let h = self.header();
        let magic = h.magic.load(Ordering::Acquire);
        let version = h.version.load(Ordering::Acquire);
        if magic != SHM_MAGIC || version != SHM_VERSION {
            return Err(RenderwardError::Protocol(format!(
                "shared memory header corrupt (magic {magic:#010x}, version {version})"
            )));
        }
        Ok(())
    }
}

/// Held region mutex; clears the recorded owner before releasing
struct RegionLock<'a> {
    owner: &'a AtomicU32,
    _guard: NamedLockGuard<'a>,
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::Release);
    }
}

/// Command/result exchange over a named shared-memory region
pub struct SharedMemoryChannel {
    name: String,
    role: Role,
    region: RwLock<Option<Region>>,
    slot_wait: Duration,
    state: StateCell,
    stats: StatCounters,
}

fn sync_names(name: &str) -> (String, String, String) {
    (
        format!("{name}_Command"),
        format!("{name}_Result"),
        format!("{name}_Mutex"),
    )
}

impl SharedMemoryChannel {
    /// Create the region as its owner (parent side)
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if !(MIN_SHARED_MEMORY_SIZE..=MAX_SHARED_MEMORY_SIZE).contains(&size) {
            return Err(RenderwardError::ChannelInit(format!(
                "shared memory size {size} outside {MIN_SHARED_MEMORY_SIZE}..={MAX_SHARED_MEMORY_SIZE}"
            )));
        }

        let mapping = Mapping::create(name, size)?;
        let (cmd, res, mtx) = sync_names(name);
        let region = Region {
            command_event: NamedEvent::create(&cmd)?,
            result_event: NamedEvent::create(&res)?,
            lock: NamedLock::create(&mtx)?,
            slot_capacity: (size - HEADER_AREA) / 2,
            mapping,
        };

        let h = region.header();
        h.total_size.store(size as u64, Ordering::Relaxed);
        h.command_size.store(0, Ordering::Relaxed);
        h.result_size.store(0, Ordering::Relaxed);
        h.command_ready.store(0, Ordering::Relaxed);
        h.result_ready.store(0, Ordering::Relaxed);
        h.command_sequence.store(0, Ordering::Relaxed);
        h.result_sequence.store(0, Ordering::Relaxed);
        h.lock_owner.store(0, Ordering::Relaxed);
        h.version.store(SHM_VERSION, Ordering::Release);
        h.magic.store(SHM_MAGIC, Ordering::Release);

        tracing::info!(name, size, slot = region.slot_capacity, "shared memory created");
        Ok(Self::with_region(name, Role::Server, region))
    }

    /// Attach to a region created by the parent (child side)
    pub fn connect(name: &str) -> Result<Self> {
        let mapping = Mapping::open(name)?;
        if mapping.len() < MIN_SHARED_MEMORY_SIZE {
            return Err(RenderwardError::ChannelInit(format!(
                "shared memory {name} too small ({} bytes)",
                mapping.len()
            )));
        }
        let (cmd, res, mtx) = sync_names(name);
        let mut region = Region {
            command_event: NamedEvent::open(&cmd)?,
            result_event: NamedEvent::open(&res)?,
            lock: NamedLock::open(&mtx)?,
            slot_capacity: 0,
            mapping,
        };
        region.validate().map_err(|e| RenderwardError::ChannelInit(e.to_string()))?;

        // The OS may round the mapping up; the header has the real size.
        let total = usize::try_from(region.header().total_size.load(Ordering::Acquire))
            .unwrap_or(usize::MAX)
            .min(region.mapping.len());
        region.slot_capacity = total.saturating_sub(HEADER_AREA) / 2;

        tracing::info!(name, size = total, "connected to shared memory");
        Ok(Self::with_region(name, Role::Client, region))
    }

    fn with_region(name: &str, role: Role, region: Region) -> Self {
        Self {
            name: name.to_string(),
            role,
            region: RwLock::new(Some(region)),
            slot_wait: Duration::from_millis(50),
            state: StateCell::new(ConnectionState::Connected),
            stats: StatCounters::default(),
        }
    }

    /// How long a write waits for an unread slot to drain
    #[must_use]
    pub const fn with_slot_wait(mut self, wait: Duration) -> Self {
        self.slot_wait = wait;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Largest payload one slot can hold, 0 after cleanup
    #[must_use]
    pub fn slot_capacity(&self) -> usize {
        self.region.read().as_ref().map_or(0, |r| r.slot_capacity)
    }

    #[must_use]
    pub fn slot_state(&self, slot: Slot) -> Option<SlotState> {
        let guard = self.region.read();
        let region = guard.as_ref()?;
        let (ready, size, sequence) = region.fields(slot);
        Some(SlotState {
            ready: ready.load(Ordering::Acquire) != 0,
            size: size.load(Ordering::Acquire),
            sequence: sequence.load(Ordering::Acquire),
        })
    }

    /// Write raw bytes into `slot`
    pub fn write_slot(&self, slot: Slot, bytes: &[u8]) -> Result<()> {
        self.write_slot_within(slot, bytes, LOCK_TIMEOUT)
    }

    /// Write raw bytes into `slot`, giving up once `budget` has passed
    ///
    /// Both the mutex wait and the wait for an unread slot to drain count
    /// against the budget.
    pub fn write_slot_within(&self, slot: Slot, bytes: &[u8], budget: Duration) -> Result<()> {
        let guard = self.region.read();
        let region = guard.as_ref().ok_or(RenderwardError::NotConnected)?;

        if bytes.len() > region.slot_capacity {
            self.stats.error();
            return Err(RenderwardError::MessageTooLarge {
                size: bytes.len(),
                max: region.slot_capacity,
            });
        }

        let started = Instant::now();
        let lock_deadline = started + budget;
        let slot_deadline = started + self.slot_wait.min(budget);
        loop {
            let remaining = lock_deadline.saturating_duration_since(Instant::now());
            let Some(lock) = region.lock(remaining)? else {
                self.stats.timeout();
                return Err(RenderwardError::ChannelBusy("shared memory mutex"));
            };
            if let Err(e) = region.validate() {
                self.stats.error();
                return Err(e);
            }

            let (ready, size, sequence) = region.fields(slot);
            if ready.load(Ordering::Acquire) == 0 {
                // SAFETY: length checked against slot_capacity above; the
                // region mutex excludes every other reader and writer.
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.slot_ptr(slot), bytes.len());
                }
                size.store(bytes.len() as u64, Ordering::Release);
                sequence.fetch_add(1, Ordering::AcqRel);
                ready.store(1, Ordering::Release);
                region.event(slot).signal()?;
                drop(lock);

                self.stats.sent(bytes.len());
                tracing::trace!(channel = %self.name, slot = slot.label(), len = bytes.len(), "slot written");
                return Ok(());
            }
            drop(lock);

            if Instant::now() >= slot_deadline {
                self.stats.timeout();
                return Err(RenderwardError::ChannelBusy(slot.label()));
            }
            std::thread::sleep(SLOT_RETRY);
        }
    }

    /// Take the message waiting in `slot`, waiting up to `timeout`
    pub fn read_slot(&self, slot: Slot, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let guard = self.region.read();
        let region = guard.as_ref().ok_or(RenderwardError::NotConnected)?;

        let (ready, size, _) = region.fields(slot);
        if ready.load(Ordering::Acquire) == 0 && !region.event(slot).wait(timeout)? {
            return Ok(None);
        }

        let Some(lock) = region.lock(LOCK_TIMEOUT)? else {
            self.stats.timeout();
            return Err(RenderwardError::ChannelBusy("shared memory mutex"));
        };
        if let Err(e) = region.validate() {
            self.stats.error();
            return Err(e);
        }
        if ready.load(Ordering::Acquire) == 0 {
            // Leftover wakeup from a message already consumed.
            return Ok(None);
        }

        let len = usize::try_from(size.load(Ordering::Acquire)).unwrap_or(usize::MAX);
        if len > region.slot_capacity {
            ready.store(0, Ordering::Release);
            self.stats.error();
            return Err(RenderwardError::Protocol(format!(
                "{} claims {len} bytes (capacity {})",
                slot.label(),
                region.slot_capacity
            )));
        }

        let mut bytes = vec![0u8; len];
        // SAFETY: len <= slot_capacity and the mutex is held.
        unsafe {
            std::ptr::copy_nonoverlapping(region.slot_ptr(slot), bytes.as_mut_ptr(), len);
        }
        ready.store(0, Ordering::Release);
        drop(lock);

        self.stats.received(len);
        Ok(Some(bytes))
    }

    /// Copy of the raw slot bytes, for inspection
    #[must_use]
    pub fn peek_slot(&self, slot: Slot, len: usize) -> Option<Vec<u8>> {
        let guard = self.region.read();
        let region = guard.as_ref()?;
        let len = len.min(region.slot_capacity);
        let mut bytes = vec![0u8; len];
        // SAFETY: bounded by slot_capacity.
        unsafe {
            std::ptr::copy_nonoverlapping(region.slot_ptr(slot), bytes.as_mut_ptr(), len);
        }
        Some(bytes)
    }
}

impl TransportChannel for SharedMemoryChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::SharedMemory
    }

    fn send_command(&self, command: &RenderCommand) -> Result<()> {
        self.write_slot(Slot::Command, &encode_command(command)?)
    }

    fn send_command_within(&self, command: &RenderCommand, budget: Duration) -> Result<()> {
        self.write_slot_within(Slot::Command, &encode_command(command)?, budget)
    }

    fn receive_command(&self, timeout: Duration) -> Result<Option<RenderCommand>> {
        self.read_slot(Slot::Command, timeout)?
            .map(|bytes| decode_command(&bytes))
            .transpose()
    }

    fn send_result(&self, result: &RenderResult) -> Result<()> {
        self.write_slot(Slot::Result, &encode_result(result)?)
    }

    fn receive_result(&self, timeout: Duration) -> Result<Option<RenderResult>> {
        self.read_slot(Slot::Result, timeout)?
            .map(|bytes| decode_result(&bytes))
            .transpose()
    }

    fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    fn statistics(&self) -> ChannelStats {
        self.stats.snapshot()
    }

    fn reset_statistics(&self) {
        self.stats.reset();
    }

    fn cleanup(&self) {
        if self.region.write().take().is_some() {
            self.state.set(ConnectionState::Disconnected);
            tracing::debug!(channel = %self.name, server = self.role == Role::Server, "shared memory released");
        }
    }
}

impl Drop for SharedMemoryChannel {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandType, ContentParameters, ResultStatus};
    use std::sync::atomic::AtomicUsize;

    fn unique(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "rw_test_{tag}_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn command_and_result_cross_the_region() {
        let name = unique("roundtrip");
        let server = SharedMemoryChannel::create(&name, 64 * 1024).unwrap();
        let client = SharedMemoryChannel::connect(&name).unwrap();

        let mut command = RenderCommand::new(CommandType::Render, 11);
        command.command_id = 5;
        server.send_command(&command).unwrap();

        let received = client
            .receive_command(Duration::from_secs(1))
            .unwrap()
            .expect("command");
        assert_eq!(received, command);

        client
            .send_result(&RenderResult::success(5, 11))
            .unwrap();
        let result = server
            .receive_result(Duration::from_secs(1))
            .unwrap()
            .expect("result");
        assert_eq!(result.command_id, 5);
        assert_eq!(result.status, ResultStatus::Success);

        assert_eq!(server.statistics().messages_sent, 1);
        assert_eq!(server.statistics().messages_received, 1);
    }

    #[test]
    fn empty_slot_times_out_with_none() {
        let name = unique("empty");
        let server = SharedMemoryChannel::create(&name, 64 * 1024).unwrap();
        let started = Instant::now();
        assert!(server.receive_result(Duration::from_millis(30)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn oversized_command_leaves_region_untouched() {
        let name = unique("oversize");
        let server = SharedMemoryChannel::create(&name, 64 * 1024).unwrap();
        let before = server.slot_state(Slot::Command).unwrap();
        let before_bytes = server.peek_slot(Slot::Command, 256).unwrap();

        let mut command = RenderCommand::new(CommandType::UpdateContent, 1);
        command.content = ContentParameters {
            source_url: "x".repeat(70 * 1024),
            ..ContentParameters::default()
        };
        let err = server.send_command(&command).unwrap_err();
        assert!(matches!(err, RenderwardError::MessageTooLarge { .. }));

        assert_eq!(server.slot_state(Slot::Command).unwrap(), before);
        assert_eq!(server.peek_slot(Slot::Command, 256).unwrap(), before_bytes);
        assert_eq!(server.statistics().messages_sent, 0);
        assert_eq!(server.statistics().errors, 1);
    }

    #[test]
    fn unread_slot_is_not_overwritten() {
        let name = unique("busy");
        let server = SharedMemoryChannel::create(&name, 64 * 1024)
            .unwrap()
            .with_slot_wait(Duration::from_millis(5));
        server.write_slot(Slot::Command, b"first").unwrap();
        let err = server.write_slot(Slot::Command, b"second").unwrap_err();
        assert!(matches!(err, RenderwardError::ChannelBusy(_)));

        let client = SharedMemoryChannel::connect(&name).unwrap();
        let got = client.read_slot(Slot::Command, Duration::from_millis(100)).unwrap();
        assert_eq!(got.as_deref(), Some(&b"first"[..]));
        assert_eq!(server.slot_state(Slot::Command).unwrap().sequence, 1);
    }

    #[test]
    fn held_mutex_bounds_the_write_by_its_budget() {
        let name = unique("held");
        let server = SharedMemoryChannel::create(&name, 64 * 1024).unwrap();
        let (locked_tx, locked_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let guard = server.region.read();
                let region = guard.as_ref().unwrap();
                let _lock = region.lock(Duration::from_secs(1)).unwrap().expect("free mutex");
                locked_tx.send(()).unwrap();
                let _ = release_rx.recv();
            });
            locked_rx.recv().unwrap();

            let started = Instant::now();
            let err = server
                .write_slot_within(Slot::Command, b"late", Duration::from_millis(60))
                .unwrap_err();
            assert!(matches!(err, RenderwardError::ChannelBusy("shared memory mutex")));
            assert!(started.elapsed() < Duration::from_millis(1000));
            release_tx.send(()).unwrap();
        });

        server.write_slot(Slot::Command, b"on time").unwrap();
        assert_eq!(server.statistics().timeouts, 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn mutex_abandoned_by_a_dead_writer_is_recovered() {
        let name = unique("abandoned");
        let server = SharedMemoryChannel::create(&name, 64 * 1024).unwrap();

        let mut writer = std::process::Command::new("true").spawn().unwrap();
        let dead = writer.id();
        writer.wait().unwrap();
        {
            let guard = server.region.read();
            let region = guard.as_ref().unwrap();
            std::mem::forget(region.lock.acquire(Duration::from_secs(1)).unwrap());
            region.header().lock_owner.store(dead, Ordering::Release);
        }

        let started = Instant::now();
        server
            .write_slot_within(Slot::Command, b"after crash", Duration::from_secs(2))
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        let guard = server.region.read();
        let region = guard.as_ref().unwrap();
        assert_eq!(region.header().lock_owner.load(Ordering::Acquire), 0);
        assert!(region.lock.acquire(Duration::from_millis(20)).unwrap().is_some());
    }

    #[cfg(windows)]
    #[test]
    fn second_server_on_same_name_fails() {
        let name = unique("dup");
        let _first = SharedMemoryChannel::create(&name, 64 * 1024).unwrap();
        assert!(matches!(
            SharedMemoryChannel::create(&name, 64 * 1024),
            Err(RenderwardError::ChannelInit(_))
        ));
    }

    #[test]
    fn size_bounds_are_enforced() {
        assert!(SharedMemoryChannel::create(&unique("small"), 1024).is_err());
        assert!(SharedMemoryChannel::create(&unique("big"), MAX_SHARED_MEMORY_SIZE + 1).is_err());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let name = unique("cleanup");
        let server = SharedMemoryChannel::create(&name, 64 * 1024).unwrap();
        server.cleanup();
        server.cleanup();
        assert!(!server.is_connected());
        assert!(matches!(
            server.send_command(&RenderCommand::new(CommandType::Render, 1)),
            Err(RenderwardError::NotConnected)
        ));
    }
}
