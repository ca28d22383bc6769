//! Win32 handles, file mappings, events and mutexes

pub mod pipe;

use crate::{RenderwardError, Result};
use std::sync::atomic::AtomicU32;
use std::time::Duration;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_ABANDONED,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION,
    MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile, OpenFileMappingW, PAGE_READWRITE,
    UnmapViewOfFile, VirtualQuery,
};
use windows::Win32::System::Threading::{
    CreateEventW, CreateMutexW, EVENT_ALL_ACCESS, MUTEX_ALL_ACCESS, OpenEventW, OpenMutexW,
    ReleaseMutex, SetEvent, WaitForSingleObject,
};
use windows::core::HSTRING;

/// Sole owner of a kernel handle; closed once on drop
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    /// Take ownership of `handle`
    ///
    /// # Safety
    /// `handle` must be open and not owned elsewhere.
    #[must_use]
    pub const unsafe fn from_raw(handle: HANDLE) -> Self {
        Self(handle)
    }

    #[must_use]
    pub const fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() && self.0 != INVALID_HANDLE_VALUE {
            // SAFETY: the handle is owned by this wrapper alone.
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

// SAFETY: kernel handles are process-wide values usable from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

pub(crate) fn duration_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1)
}

fn local_name(name: &str) -> HSTRING {
    HSTRING::from(format!("Local\\{name}"))
}

/// Wait on `handle`; `Ok(true)` when signaled (or abandoned)
pub(crate) fn wait_handle(handle: HANDLE, timeout: Duration) -> Result<bool> {
    // SAFETY: handle is owned by the caller for the duration of the wait.
    let status = unsafe { WaitForSingleObject(handle, duration_ms(timeout)) };
    if status == WAIT_OBJECT_0 || status == WAIT_ABANDONED {
        Ok(true)
    } else if status == WAIT_TIMEOUT {
        Ok(false)
    } else {
        Err(windows::core::Error::from_win32().into())
    }
}

/// A mapped view of a named page-file backed section
pub struct Mapping {
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
    _section: OwnedHandle,
}

impl Mapping {
    /// Create `name` with `size` bytes; fails if it already exists
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let wide = local_name(name);
        let size64 = size as u64;
        // SAFETY: page-file backed section, no security attributes.
        let section = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                (size64 >> 32) as u32,
                (size64 & 0xFFFF_FFFF) as u32,
                &wide,
            )
        }
        .map_err(|e| RenderwardError::ChannelInit(format!("CreateFileMapping {name}: {e}")))?;
        // SAFETY: read immediately after the call that set it.
        let already = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
        // SAFETY: section was just returned to us.
        let section = unsafe { OwnedHandle::from_raw(section) };
        if already {
            return Err(RenderwardError::ChannelInit(format!(
                "shared memory {name} already exists"
            )));
        }
        Self::map(section, size)
    }

    /// Map an existing `name` at its full size
    pub fn open(name: &str) -> Result<Self> {
        let wide = local_name(name);
        // SAFETY: opening a named section by name.
        let section = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, &wide) }
            .map_err(|e| RenderwardError::ChannelInit(format!("OpenFileMapping {name}: {e}")))?;
        // SAFETY: section was just returned to us.
        let section = unsafe { OwnedHandle::from_raw(section) };
        Self::map(section, 0)
    }

    fn map(section: OwnedHandle, size: usize) -> Result<Self> {
        // SAFETY: section is a valid mapping handle; size 0 maps it whole.
        let view = unsafe { MapViewOfFile(section.raw(), FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            return Err(RenderwardError::ChannelInit(format!(
                "MapViewOfFile: {}",
                windows::core::Error::from_win32()
            )));
        }

        let len = if size == 0 {
            let mut info = MEMORY_BASIC_INFORMATION::default();
            // SAFETY: queries our own freshly mapped view.
            let written = unsafe {
                VirtualQuery(
                    Some(view.Value),
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 {
                // SAFETY: unmapping the view created above.
                unsafe {
                    let _ = UnmapViewOfFile(view);
                }
                return Err(RenderwardError::ChannelInit("VirtualQuery failed".into()));
            }
            info.RegionSize
        } else {
            size
        };

        Ok(Self {
            view,
            len,
            _section: section,
        })
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.view.Value.cast()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: view came from MapViewOfFile and is unmapped once; the
        // section handle closes after this via OwnedHandle.
        unsafe {
            let _ = UnmapViewOfFile(self.view);
        }
    }
}

// SAFETY: the view is shared memory guarded by the channel's mutex.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Named auto-reset event
pub struct NamedEvent(OwnedHandle);

impl NamedEvent {
    pub fn create(name: &str) -> Result<Self> {
        let wide = local_name(name);
        // SAFETY: auto-reset, initially unsignaled.
        let handle = unsafe { CreateEventW(None, false, false, &wide) }
            .map_err(|e| RenderwardError::ChannelInit(format!("CreateEvent {name}: {e}")))?;
        // SAFETY: handle was just returned to us.
        Ok(Self(unsafe { OwnedHandle::from_raw(handle) }))
    }

    pub fn open(name: &str) -> Result<Self> {
        let wide = local_name(name);
        // SAFETY: opening a named event by name.
        let handle = unsafe { OpenEventW(EVENT_ALL_ACCESS, false, &wide) }
            .map_err(|e| RenderwardError::ChannelInit(format!("OpenEvent {name}: {e}")))?;
        // SAFETY: handle was just returned to us.
        Ok(Self(unsafe { OwnedHandle::from_raw(handle) }))
    }

    pub fn signal(&self) -> Result<()> {
        // SAFETY: owned event handle.
        unsafe { SetEvent(self.0.raw()) }?;
        Ok(())
    }

    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        wait_handle(self.0.raw(), timeout)
    }
}

/// Named kernel mutex
pub struct NamedLock(OwnedHandle);

/// Held mutex; released on drop
pub struct NamedLockGuard<'a>(&'a OwnedHandle);

impl NamedLock {
    pub fn create(name: &str) -> Result<Self> {
        let wide = local_name(name);
        // SAFETY: not initially owned.
        let handle = unsafe { CreateMutexW(None, false, &wide) }
            .map_err(|e| RenderwardError::ChannelInit(format!("CreateMutex {name}: {e}")))?;
        // SAFETY: handle was just returned to us.
        Ok(Self(unsafe { OwnedHandle::from_raw(handle) }))
    }

    pub fn open(name: &str) -> Result<Self> {
        let wide = local_name(name);
        // SAFETY: opening a named mutex by name.
        let handle = unsafe { OpenMutexW(MUTEX_ALL_ACCESS, false, &wide) }
            .map_err(|e| RenderwardError::ChannelInit(format!("OpenMutex {name}: {e}")))?;
        // SAFETY: handle was just returned to us.
        Ok(Self(unsafe { OwnedHandle::from_raw(handle) }))
    }

    /// `Ok(None)` if the mutex was not acquired within `timeout`
    ///
    /// An abandoned mutex counts as acquired; the header is revalidated by
    /// the reader anyway.
    pub fn acquire(&self, timeout: Duration) -> Result<Option<NamedLockGuard<'_>>> {
        Ok(wait_handle(self.0.raw(), timeout)?.then(|| NamedLockGuard(&self.0)))
    }

    /// Kernel mutexes hand an abandoned lock to the next waiter, so there is
    /// never anything to take over here
    pub fn recover(&self, _holder: &AtomicU32) -> Option<NamedLockGuard<'_>> {
        None
    }
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: released by the thread that acquired it.
        unsafe {
            let _ = ReleaseMutex(self.0.raw());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn timed_out_acquire_leaves_holder_in_place() {
        let lock = Arc::new(NamedLock::create(&format!("rw_os_lock_{}", std::process::id())).unwrap());
        let held = lock.acquire(Duration::from_millis(20)).unwrap().expect("free lock");

        let other = Arc::clone(&lock);
        let contended = std::thread::spawn(move || {
            (0..3).all(|_| other.acquire(Duration::from_millis(20)).unwrap().is_none())
        });
        assert!(contended.join().unwrap());

        drop(held);
        let other = Arc::clone(&lock);
        let acquired =
            std::thread::spawn(move || other.acquire(Duration::from_millis(20)).unwrap().is_some());
        assert!(acquired.join().unwrap());
    }
}
