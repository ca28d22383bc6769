//! Unix domain sockets standing in for named pipes

use crate::{RenderwardError, Result};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const CONNECT_RETRY: Duration = Duration::from_millis(50);
/// Socket timeouts of zero mean "forever"
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Socket path for a pipe name; names containing `/` are used as paths
#[must_use]
pub fn socket_path(name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        std::env::temp_dir().join(format!("{name}.sock"))
    }
}

pub struct RawListener {
    listener: UnixListener,
    path: PathBuf,
}

impl RawListener {
    pub fn bind(name: &str) -> Result<Self> {
        let path = socket_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .map_err(|e| RenderwardError::ChannelInit(format!("bind {}: {e}", path.display())))?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, path })
    }

    /// Wait up to `timeout` for one client
    pub fn accept(&self, timeout: Duration) -> Result<Option<RawStream>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(Some(RawStream { stream }));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for RawListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct RawStream {
    stream: UnixStream,
}

impl RawStream {
    /// Connect, retrying while the server is not listening yet
    pub fn connect(name: &str, timeout: Duration) -> Result<Self> {
        let path = socket_path(name);
        let deadline = Instant::now() + timeout;
        loop {
            match UnixStream::connect(&path) {
                Ok(stream) => return Ok(Self { stream }),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::WouldBlock
                    ) && Instant::now() < deadline =>
                {
                    std::thread::sleep(CONNECT_RETRY);
                }
                Err(e) => {
                    return Err(RenderwardError::ChannelInit(format!(
                        "connect {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    /// Write all of `bytes` within `timeout`
    ///
    /// A peer that stops reading fills the socket buffer; the write gives up
    /// at the deadline with whatever part of `bytes` already went out.
    pub fn write_all(&self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut offset = 0;
        while offset < bytes.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RenderwardError::WriteTimeout(timeout));
            }
            self.stream.set_write_timeout(Some(remaining.max(MIN_WAIT)))?;
            match (&self.stream).write(&bytes[offset..]) {
                Ok(0) => return Err(RenderwardError::NotConnected),
                Ok(n) => offset += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(map_disconnect(e)),
            }
        }
        Ok(())
    }

    /// Read whatever arrives within `timeout`; `Ok(0)` means nothing did
    pub fn read_available(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.stream.set_read_timeout(Some(timeout.max(MIN_WAIT)))?;
        match (&self.stream).read(buf) {
            Ok(0) => Err(RenderwardError::NotConnected),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(map_disconnect(e)),
        }
    }

    #[must_use]
    pub fn peer_pid(&self) -> Option<u32> {
        getsockopt(&self.stream, PeerCredentials)
            .ok()
            .and_then(|cred| u32::try_from(cred.pid()).ok())
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn map_disconnect(e: std::io::Error) -> RenderwardError {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
            RenderwardError::NotConnected
        }
        _ => RenderwardError::Io(e),
    }
}
