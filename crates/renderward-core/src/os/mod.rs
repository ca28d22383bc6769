//! Platform primitives behind the transports
//!
//! Both platforms expose the same names: `Mapping`, `NamedEvent`,
//! `NamedLock` and, under `pipe`, `RawListener` / `RawStream`.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(windows)]
pub mod windows;
#[cfg(windows)]
pub use self::windows::{Mapping, NamedEvent, NamedLock, NamedLockGuard, pipe};
