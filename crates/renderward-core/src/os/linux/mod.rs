//! POSIX shared memory and named semaphores

pub mod pipe;

use crate::{RenderwardError, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::signal::kill;
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn posix_name(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('/') || name.len() > 200 {
        return Err(RenderwardError::ChannelInit(format!("invalid ipc name {name:?}")));
    }
    Ok(format!("/{name}"))
}

/// A shared mapping of a named POSIX shm object
pub struct Mapping {
    ptr: NonNull<libc::c_void>,
    len: usize,
    /// Set on the creating side, which unlinks the name on drop
    owned_name: Option<String>,
}

impl Mapping {
    /// Create `name` with `size` bytes
    ///
    /// POSIX names outlive a crashed creator, so a leftover object under
    /// `name` is unlinked first and replaced.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let path = posix_name(name)?;
        if shm_unlink(path.as_str()).is_ok() {
            tracing::warn!(name, "removed stale shared memory object");
        }
        let fd = shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| match e {
            Errno::EEXIST => {
                RenderwardError::ChannelInit(format!("shared memory {name} already exists"))
            }
            other => RenderwardError::ChannelInit(format!("shm_open {name}: {other}")),
        })?;
        let file = File::from(fd);
        if let Err(e) = file.set_len(size as u64) {
            let _ = shm_unlink(path.as_str());
            return Err(RenderwardError::ChannelInit(format!("sizing {name}: {e}")));
        }

        match Self::map(&file, size) {
            Ok(ptr) => Ok(Self {
                ptr,
                len: size,
                owned_name: Some(path),
            }),
            Err(e) => {
                let _ = shm_unlink(path.as_str());
                Err(e)
            }
        }
    }

    /// Map an existing `name` at its full size
    pub fn open(name: &str) -> Result<Self> {
        let path = posix_name(name)?;
        let fd = shm_open(path.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| RenderwardError::ChannelInit(format!("shm_open {name}: {e}")))?;
        let file = File::from(fd);
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| RenderwardError::ChannelInit(format!("{name} too large to map")))?;
        let ptr = Self::map(&file, len)?;
        Ok(Self {
            ptr,
            len,
            owned_name: None,
        })
    }

    fn map(file: &File, len: usize) -> Result<NonNull<libc::c_void>> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| RenderwardError::ChannelInit("empty shared memory object".into()))?;
        // SAFETY: fresh shared mapping of a file we hold open; no existing
        // Rust references alias it.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )
        }
        .map_err(|e| RenderwardError::ChannelInit(format!("mmap: {e}")))?;
        Ok(ptr)
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap and are unmapped once.
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
        if let Some(path) = &self.owned_name {
            let _ = shm_unlink(path.as_str());
        }
    }
}

// SAFETY: the mapping is plain shared memory; access is coordinated by the
// channel's lock and atomics.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Named POSIX semaphore
struct Semaphore {
    sem: NonNull<libc::sem_t>,
    name: CString,
    owner: bool,
}

impl Semaphore {
    fn create(name: &str, initial: u32) -> Result<Self> {
        let cname = CString::new(posix_name(name)?)
            .map_err(|_| RenderwardError::ChannelInit(format!("invalid ipc name {name:?}")))?;
        // SAFETY: valid NUL-terminated name; a stale semaphore from a dead
        // run is removed so the new one starts at `initial`.
        let sem = unsafe {
            libc::sem_unlink(cname.as_ptr());
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        Self::wrap(sem, cname, true, name)
    }

    fn open(name: &str) -> Result<Self> {
        let cname = CString::new(posix_name(name)?)
            .map_err(|_| RenderwardError::ChannelInit(format!("invalid ipc name {name:?}")))?;
        // SAFETY: valid NUL-terminated name.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        Self::wrap(sem, cname, false, name)
    }

    fn wrap(sem: *mut libc::sem_t, name: CString, owner: bool, label: &str) -> Result<Self> {
        if sem == libc::SEM_FAILED {
            return Err(RenderwardError::ChannelInit(format!(
                "sem_open {label}: {}",
                std::io::Error::last_os_error()
            )));
        }
        let sem = NonNull::new(sem)
            .ok_or_else(|| RenderwardError::ChannelInit(format!("sem_open {label}: null")))?;
        Ok(Self { sem, name, owner })
    }

    fn post(&self) -> Result<()> {
        // SAFETY: sem is a live semaphore from sem_open.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// `Ok(false)` on timeout
    fn wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout);
        loop {
            // SAFETY: sem is live; deadline is a valid timespec.
            let rc = unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) };
            if rc == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EINTR => {}
                Errno::ETIMEDOUT => return Ok(false),
                other => return Err(other.into()),
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: closed exactly once; only the creator unlinks the name.
        unsafe {
            libc::sem_close(self.sem.as_ptr());
            if self.owner {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

// SAFETY: POSIX semaphores are designed for concurrent use.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: writes into a local timespec.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }
    let nanos = i64::from(now.tv_nsec) + i64::from(timeout.subsec_nanos());
    let secs = i64::from(now.tv_sec)
        .saturating_add(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX / 2))
        .saturating_add(nanos / 1_000_000_000);
    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    }
}

/// Auto-reset style event
pub struct NamedEvent(Semaphore);

impl NamedEvent {
    pub fn create(name: &str) -> Result<Self> {
        Semaphore::create(name, 0).map(Self)
    }

    pub fn open(name: &str) -> Result<Self> {
        Semaphore::open(name).map(Self)
    }

    pub fn signal(&self) -> Result<()> {
        self.0.post()
    }

    /// `Ok(false)` on timeout
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        self.0.wait(timeout)
    }
}

/// Cross-process mutual exclusion
pub struct NamedLock(Semaphore);

/// Held lock; released on drop
pub struct NamedLockGuard<'a>(&'a Semaphore);

impl NamedLock {
    pub fn create(name: &str) -> Result<Self> {
        Semaphore::create(name, 1).map(Self)
    }

    pub fn open(name: &str) -> Result<Self> {
        Semaphore::open(name).map(Self)
    }

    /// `Ok(None)` if the lock was not acquired within `timeout`
    pub fn acquire(&self, timeout: Duration) -> Result<Option<NamedLockGuard<'_>>> {
        Ok(self.0.wait(timeout)?.then(|| NamedLockGuard(&self.0)))
    }

    /// Take over a lock whose holder died without releasing it
    ///
    /// `holder` is the shared word the lock's users record their pid in while
    /// holding it. A semaphore has no owner, so a crashed holder would leave
    /// it at zero forever; the compare-exchange lets exactly one survivor
    /// adopt the held count.
    pub fn recover(&self, holder: &AtomicU32) -> Option<NamedLockGuard<'_>> {
        let pid = holder.load(Ordering::Acquire);
        if pid == 0 || pid == std::process::id() || process_alive(pid) {
            return None;
        }
        holder
            .compare_exchange(pid, std::process::id(), Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        tracing::warn!(dead_holder = pid, "recovered lock abandoned by a dead process");
        Some(NamedLockGuard(&self.0))
    }
}

/// Whether `pid` names a live, non-zombie process
fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let (_, rest) = stat.rsplit_once(')')?;
                rest.split_whitespace().next().map(|state| state != "Z")
            })
            .unwrap_or(true),
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn unique(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "rw_os_{tag}_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn sem_value(lock: &NamedLock) -> i32 {
        let mut value = -1;
        // SAFETY: the semaphore is live for the lifetime of `lock`.
        unsafe {
            libc::sem_getvalue(lock.0.sem.as_ptr(), &mut value);
        }
        value
    }

    #[test]
    fn timed_out_acquire_leaves_holder_in_place() {
        let lock = NamedLock::create(&unique("lock")).unwrap();
        let held = lock.acquire(Duration::from_millis(20)).unwrap().expect("free lock");

        for _ in 0..3 {
            assert!(lock.acquire(Duration::from_millis(20)).unwrap().is_none());
        }
        assert_eq!(sem_value(&lock), 0);

        drop(held);
        assert_eq!(sem_value(&lock), 1);
        let again = lock.acquire(Duration::from_millis(20)).unwrap().expect("released lock");
        assert!(lock.acquire(Duration::from_millis(20)).unwrap().is_none());
        drop(again);
        assert_eq!(sem_value(&lock), 1);
    }

    #[test]
    fn lock_of_a_dead_holder_is_recovered() {
        let lock = NamedLock::create(&unique("dead")).unwrap();
        std::mem::forget(lock.acquire(Duration::from_millis(20)).unwrap().expect("free lock"));

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();

        let holder = AtomicU32::new(dead);
        let guard = lock.recover(&holder).expect("dead holder");
        assert_eq!(holder.load(Ordering::Acquire), std::process::id());
        assert!(lock.recover(&holder).is_none());
        drop(guard);
        assert_eq!(sem_value(&lock), 1);
    }

    #[test]
    fn live_holder_is_not_robbed() {
        let lock = NamedLock::create(&unique("live")).unwrap();
        let _held = lock.acquire(Duration::from_millis(20)).unwrap().expect("free lock");
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();

        let holder = AtomicU32::new(child.id());
        assert!(lock.recover(&holder).is_none());
        assert!(lock.recover(&AtomicU32::new(0)).is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn stale_mapping_name_is_replaced() {
        let name = unique("stale");
        let first = Mapping::create(&name, 4096).unwrap();
        // Leave the name behind the way a crashed creator would.
        std::mem::forget(first);

        let second = Mapping::create(&name, 8192).unwrap();
        assert_eq!(second.len(), 8192);
        drop(second);
        assert!(Mapping::open(&name).is_err());
    }
}
