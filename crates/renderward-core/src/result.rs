//! Render result types

use crate::protocol::now_millis;
use serde::{Deserialize, Serialize};

/// Outcome reported by the renderer for one command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResultStatus {
    Success = 0,
    Failure = 1,
    Pending = 2,
    BackendNotSupported = 3,
    ContentLoadError = 4,
    InvalidParameters = 5,
}

/// Reply to a [`RenderCommand`](crate::RenderCommand)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    /// Id of the originating command
    pub command_id: u64,
    pub widget_id: u32,
    pub status: ResultStatus,
    pub error_message: String,
    pub render_time_ms: f64,
    pub frame_count: u32,
    pub average_fps: f32,
    pub memory_usage_mb: u64,
    pub timestamp: u64,
}

impl RenderResult {
    /// Successful reply with zeroed metrics
    #[must_use]
    pub fn success(command_id: u64, widget_id: u32) -> Self {
        Self {
            command_id,
            widget_id,
            status: ResultStatus::Success,
            error_message: String::new(),
            render_time_ms: 0.0,
            frame_count: 0,
            average_fps: 0.0,
            memory_usage_mb: 0,
            timestamp: now_millis(),
        }
    }

    /// Failed reply carrying a message
    #[must_use]
    pub fn failure(command_id: u64, widget_id: u32, message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            error_message: message.into(),
            ..Self::success(command_id, widget_id)
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: ResultStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    #[must_use]
    pub fn with_render_time(mut self, ms: f64) -> Self {
        self.render_time_ms = ms;
        self
    }

    /// Check if the renderer reported success
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}
