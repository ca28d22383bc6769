//! Multi-client message manager
//!
//! Independent of the render bridge: a server accepts any number of client
//! processes on one pipe name and exchanges channel-routed JSON messages
//! with them, including a request/response pattern.

pub mod manager;
pub mod message;

pub use manager::{ConnectionInfo, IpcManager, ManagerStatistics};
pub use message::{IpcMessage, MessageKind};
