//! # renderward-core
//!
//! Out-of-process renderer hosting with sandboxing and dual-channel IPC.
//!
//! This crate provides:
//! - Sandboxed launch and supervision of a renderer process, with restart
//!   policies and exponential backoff
//! - A shared-memory command/result channel and a framed named-pipe channel
//! - A bridge correlating commands with results across both channels
//! - The child-side endpoint a renderer runs its backend behind
//! - A general request/response message manager over named pipes

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(any(windows, target_os = "linux")))]
compile_error!("renderward-core supports Windows and Linux only");

pub mod bridge;
pub mod child;
pub mod config;
pub mod correlation;
pub mod error;
pub mod ipc;
pub mod isolation;
pub mod os;
pub mod pipe;
pub mod process;
pub mod protocol;
pub mod result;
pub mod shm;
pub mod supervisor;
pub mod transport;

pub use bridge::{BridgeStatistics, PendingResult, RenderBridge};
pub use child::{ChildEndpoint, EchoBackend, RenderBackend};
pub use config::{
    BridgeConfig, IpcConfig, IpcEndpoints, IpcMode, IpcRole, LaunchConfig, RestartPolicy,
    SandboxPolicy,
};
pub use error::RenderwardError;
pub use ipc::{IpcManager, IpcMessage, MessageKind};
pub use protocol::{
    BackendType, CommandType, ContentParameters, ContentSourceType, RenderColor, RenderCommand,
    RenderProperties, RenderRect,
};
pub use result::{RenderResult, ResultStatus};
pub use supervisor::Supervisor;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, RenderwardError>;
