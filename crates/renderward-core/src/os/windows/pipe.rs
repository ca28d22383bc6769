//! Win32 named pipes in message mode
//!
//! Every handle is opened for overlapped I/O so accepts, reads and writes can
//! be bounded by a deadline and cancelled when it passes.

use super::{OwnedHandle, duration_ms, wait_handle};
use crate::{RenderwardError, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use windows::Win32::Foundation::{
    ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING, ERROR_MORE_DATA, ERROR_NO_DATA,
    ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED, ERROR_PIPE_NOT_CONNECTED, HANDLE,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_OVERLAPPED, FILE_GENERIC_READ, FILE_GENERIC_WRITE, FILE_SHARE_NONE,
    OPEN_EXISTING, PIPE_ACCESS_DUPLEX, ReadFile, WriteFile,
};
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, GetNamedPipeClientProcessId,
    GetNamedPipeServerProcessId, NAMED_PIPE_MODE, PIPE_READMODE_MESSAGE, PIPE_TYPE_MESSAGE,
    PIPE_UNLIMITED_INSTANCES, PIPE_WAIT, PeekNamedPipe, SetNamedPipeHandleState, WaitNamedPipeW,
};
use windows::Win32::System::Threading::CreateEventW;
use windows::core::{HSTRING, PCWSTR};

const BUFFER_SIZE: u32 = 64 * 1024;
const ACCEPT_RETRY: Duration = Duration::from_millis(10);
const READ_POLL: Duration = Duration::from_millis(2);
const CONNECT_RETRY: Duration = Duration::from_millis(50);

#[must_use]
pub fn pipe_path(name: &str) -> HSTRING {
    if name.starts_with(r"\\.\pipe\") {
        HSTRING::from(name)
    } else {
        HSTRING::from(format!(r"\\.\pipe\{name}"))
    }
}

fn is_disconnect(e: &windows::core::Error) -> bool {
    [ERROR_BROKEN_PIPE, ERROR_PIPE_NOT_CONNECTED, ERROR_NO_DATA]
        .iter()
        .any(|code| e.code() == code.to_hresult())
}

fn pipe_error(e: windows::core::Error) -> RenderwardError {
    if is_disconnect(&e) {
        RenderwardError::NotConnected
    } else {
        e.into()
    }
}

/// Manual-reset event for one overlapped direction
fn io_event() -> Result<OwnedHandle> {
    // SAFETY: anonymous, unsignaled manual-reset event.
    let handle = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }?;
    // SAFETY: handle was just returned to us.
    Ok(unsafe { OwnedHandle::from_raw(handle) })
}

/// Bytes moved by an overlapped operation, `None` if it was still pending
/// when `timeout` ran out
///
/// A pending operation is cancelled and then awaited, so the kernel is done
/// with `overlapped` before this returns.
fn finish(
    handle: HANDLE,
    overlapped: &OVERLAPPED,
    issued: windows::core::Result<()>,
    timeout: Duration,
) -> Result<Option<u32>> {
    let mut moved = 0u32;
    if let Err(e) = issued {
        if e.code() == ERROR_IO_PENDING.to_hresult() {
            if !wait_handle(overlapped.hEvent, timeout)? {
                // SAFETY: cancels only this operation, then blocks until the
                // kernel releases `overlapped`.
                unsafe {
                    let _ = CancelIoEx(handle, Some(overlapped as *const OVERLAPPED));
                    return Ok(GetOverlappedResult(handle, overlapped, &mut moved, true)
                        .ok()
                        .map(|()| moved));
                }
            }
        } else if e.code() != ERROR_MORE_DATA.to_hresult() {
            return Err(pipe_error(e));
        }
    }
    // SAFETY: the operation has completed.
    match unsafe { GetOverlappedResult(handle, overlapped, &mut moved, false) } {
        Ok(()) => Ok(Some(moved)),
        Err(e) if e.code() == ERROR_MORE_DATA.to_hresult() => Ok(Some(moved)),
        Err(e) => Err(pipe_error(e)),
    }
}

/// A server instance with a connect in flight
struct Listening {
    pipe: Option<OwnedHandle>,
    event: OwnedHandle,
    /// Boxed so its address stays put while the kernel holds it
    overlapped: Box<OVERLAPPED>,
    pending: bool,
}

// SAFETY: the OVERLAPPED is only touched under the listener's mutex and by
// the kernel; its raw pointers are not shared.
unsafe impl Send for Listening {}

impl Listening {
    fn start(path: &HSTRING) -> Result<Self> {
        // SAFETY: duplex message pipe opened for overlapped I/O.
        let handle = unsafe {
            CreateNamedPipeW(
                path,
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                BUFFER_SIZE,
                BUFFER_SIZE,
                0,
                None,
            )
        };
        if handle.is_invalid() {
            return Err(RenderwardError::ChannelInit(format!(
                "CreateNamedPipe: {}",
                windows::core::Error::from_win32()
            )));
        }
        // SAFETY: handle was just returned to us.
        let pipe = unsafe { OwnedHandle::from_raw(handle) };
        let event = io_event()?;
        let mut listening = Self {
            overlapped: Box::new(OVERLAPPED {
                hEvent: event.raw(),
                ..Default::default()
            }),
            pipe: Some(pipe),
            event,
            pending: false,
        };

        let overlapped: *mut OVERLAPPED = &mut *listening.overlapped;
        // SAFETY: the boxed OVERLAPPED lives until the connect completes or
        // Drop cancels it.
        match unsafe { ConnectNamedPipe(handle, Some(overlapped)) } {
            Ok(()) => {}
            Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => listening.pending = true,
            Err(e) if e.code() == ERROR_PIPE_CONNECTED.to_hresult() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(listening)
    }

    /// `Ok(true)` once a client is connected
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        if !self.pending {
            return Ok(true);
        }
        if !wait_handle(self.event.raw(), timeout)? {
            return Ok(false);
        }
        self.pending = false;
        let handle = self.pipe.as_ref().map(OwnedHandle::raw).unwrap_or_default();
        let mut moved = 0u32;
        // SAFETY: the connect has completed.
        unsafe { GetOverlappedResult(handle, &*self.overlapped, &mut moved, false) }?;
        Ok(true)
    }
}

impl Drop for Listening {
    fn drop(&mut self) {
        if let (true, Some(pipe)) = (self.pending, &self.pipe) {
            let mut moved = 0u32;
            // SAFETY: cancel the outstanding connect and wait for the kernel
            // to let go of the OVERLAPPED before it is freed.
            unsafe {
                let _ = CancelIoEx(pipe.raw(), Some(&*self.overlapped as *const OVERLAPPED));
                let _ = GetOverlappedResult(pipe.raw(), &*self.overlapped, &mut moved, true);
            }
        }
    }
}

pub struct RawListener {
    path: HSTRING,
    /// Instance currently waiting for a client
    listening: Mutex<Option<Listening>>,
}

impl RawListener {
    pub fn bind(name: &str) -> Result<Self> {
        let path = pipe_path(name);
        // Create the first instance now so clients can find the name.
        let first = Listening::start(&path)?;
        Ok(Self {
            path,
            listening: Mutex::new(Some(first)),
        })
    }

    /// Wait up to `timeout` for one client
    pub fn accept(&self, timeout: Duration) -> Result<Option<RawStream>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.listening.lock();
        loop {
            if slot.is_none() {
                *slot = Some(Listening::start(&self.path)?);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let waited = match slot.as_mut() {
                Some(listening) => listening.wait(remaining),
                None => Ok(false),
            };
            match waited {
                Ok(true) => {
                    let pipe = slot
                        .take()
                        .and_then(|mut listening| listening.pipe.take())
                        .ok_or(RenderwardError::NotConnected)?;
                    return RawStream::new(pipe, true).map(Some);
                }
                Ok(false) => {}
                Err(e) => {
                    // Client came and went; start over on a fresh instance.
                    tracing::debug!(error = %e, "pipe connect failed");
                    *slot = None;
                    std::thread::sleep(ACCEPT_RETRY);
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

pub struct RawStream {
    handle: OwnedHandle,
    server_side: bool,
    read_event: OwnedHandle,
    write_event: OwnedHandle,
}

impl RawStream {
    fn new(handle: OwnedHandle, server_side: bool) -> Result<Self> {
        Ok(Self {
            handle,
            server_side,
            read_event: io_event()?,
            write_event: io_event()?,
        })
    }

    /// Connect, waiting out busy and not-yet-created pipes
    pub fn connect(name: &str, timeout: Duration) -> Result<Self> {
        let path = pipe_path(name);
        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: opening a pipe client handle by path.
            let opened = unsafe {
                CreateFileW(
                    &path,
                    (FILE_GENERIC_READ | FILE_GENERIC_WRITE).0,
                    FILE_SHARE_NONE,
                    None,
                    OPEN_EXISTING,
                    FILE_FLAG_OVERLAPPED,
                    HANDLE::default(),
                )
            };
            match opened {
                Ok(handle) => {
                    // SAFETY: handle was just returned to us.
                    let handle = unsafe { OwnedHandle::from_raw(handle) };
                    let mode: NAMED_PIPE_MODE = PIPE_READMODE_MESSAGE;
                    // SAFETY: setting read mode on our client handle.
                    unsafe { SetNamedPipeHandleState(handle.raw(), Some(&mode), None, None) }?;
                    return Self::new(handle, false);
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(RenderwardError::ChannelInit(format!("connect pipe: {e}")));
                }
                Err(e) if e.code() == ERROR_PIPE_BUSY.to_hresult() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // SAFETY: waits for an instance of our pipe path.
                    let _ = unsafe { WaitNamedPipeW(&path, duration_ms(remaining)) };
                }
                Err(e) if e.code() == ERROR_FILE_NOT_FOUND.to_hresult() => {
                    std::thread::sleep(CONNECT_RETRY);
                }
                Err(e) => return Err(RenderwardError::ChannelInit(format!("connect pipe: {e}"))),
            }
        }
    }

    /// Write all of `bytes` within `timeout`
    ///
    /// A peer that stops reading fills the pipe buffer; the stalled write is
    /// cancelled at the deadline.
    pub fn write_all(&self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut offset = 0;
        while offset < bytes.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut overlapped = OVERLAPPED {
                hEvent: self.write_event.raw(),
                ..Default::default()
            };
            // SAFETY: `overlapped` outlives the write; finish() waits for it.
            let issued = unsafe {
                WriteFile(
                    self.handle.raw(),
                    Some(&bytes[offset..]),
                    None,
                    Some(&mut overlapped as *mut OVERLAPPED),
                )
            };
            match finish(self.handle.raw(), &overlapped, issued, remaining)? {
                Some(written) => offset += written as usize,
                None => return Err(RenderwardError::WriteTimeout(timeout)),
            }
        }
        Ok(())
    }

    /// Read whatever arrives within `timeout`; `Ok(0)` means nothing did
    ///
    /// Polls with `PeekNamedPipe` so a read is only issued when bytes are
    /// already waiting.
    pub fn read_available(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut available = 0u32;
            // SAFETY: peek without copying data.
            unsafe {
                PeekNamedPipe(self.handle.raw(), None, 0, None, Some(&mut available), None)
            }
            .map_err(pipe_error)?;

            if available > 0 {
                let want = buf.len().min(available as usize);
                let mut overlapped = OVERLAPPED {
                    hEvent: self.read_event.raw(),
                    ..Default::default()
                };
                // SAFETY: `overlapped` outlives the read; finish() waits for it.
                let issued = unsafe {
                    ReadFile(
                        self.handle.raw(),
                        Some(&mut buf[..want]),
                        None,
                        Some(&mut overlapped as *mut OVERLAPPED),
                    )
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                let read = finish(self.handle.raw(), &overlapped, issued, remaining.max(READ_POLL))?;
                return Ok(read.map_or(0, |n| n as usize));
            }

            if Instant::now() >= deadline {
                return Ok(0);
            }
            std::thread::sleep(READ_POLL);
        }
    }

    #[must_use]
    pub fn peer_pid(&self) -> Option<u32> {
        let mut pid = 0u32;
        // SAFETY: queries on our own connected handle.
        let ok = unsafe {
            if self.server_side {
                GetNamedPipeClientProcessId(self.handle.raw(), &mut pid)
            } else {
                GetNamedPipeServerProcessId(self.handle.raw(), &mut pid)
            }
        };
        ok.ok().map(|()| pid)
    }

    pub fn shutdown(&self) {
        if self.server_side {
            // SAFETY: our own server instance.
            unsafe {
                let _ = DisconnectNamedPipe(self.handle.raw());
            }
        }
    }
}
