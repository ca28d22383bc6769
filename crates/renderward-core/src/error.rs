//! Error types for renderward-core

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderwardError {
    #[error("process creation failed: {0}")]
    ProcessCreation(String),

    #[error("sandbox step failed: {0}")]
    SandboxApplication(String),

    #[error("channel init failed: {0}")]
    ChannelInit(String),

    #[error("command {0} timed out")]
    CommandTimeout(u64),

    #[error("command send failed: {0}")]
    CommandSend(String),

    #[error("process crashed with exit code {0}")]
    ProcessCrash(i32),

    #[error("restart attempts exhausted after {0} restarts")]
    RestartsExhausted(u32),

    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("channel busy: {0}")]
    ChannelBusy(&'static str),

    #[error("not connected")]
    NotConnected,

    #[error("write not finished within {0:?}")]
    WriteTimeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(target_os = "linux")]
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[cfg(windows)]
    #[error("windows error: {0}")]
    Windows(#[from] windows::core::Error),
}

impl From<rmp_serde::encode::Error> for RenderwardError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RenderwardError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for RenderwardError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Self::Io(e.into())
        } else {
            Self::Decode(e.to_string())
        }
    }
}

impl RenderwardError {
    /// Whether the error leaves the channel usable for the next message
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ChannelBusy(_) | Self::CommandTimeout(_) | Self::MessageTooLarge { .. }
        )
    }
}
