//! Render command wire contract
//!
//! Commands travel parent -> child, results child -> parent. Both are
//! MessagePack-encoded and carried either in the shared-memory slots or in
//! pipe frames.

use crate::{RenderResult, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of work a command asks the renderer to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CommandType {
    Initialize = 0,
    Render = 1,
    Resize = 2,
    Destroy = 3,
    SwitchBackend = 4,
    UpdateContent = 5,
    SetProperty = 6,
    GetSystemSnapshot = 100,
    GetProcessSnapshot = 101,
}

/// Rendering backend requested for a widget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BackendType {
    /// Let the renderer pick
    #[default]
    Auto,
    /// 2D raster canvas
    Canvas2d,
    /// Hardware 3D
    Gpu3d,
    /// Embedded web view
    WebEmbed,
}

/// Where widget content comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContentSourceType {
    #[default]
    Static,
    Web,
    Api,
    Media,
    File,
    Office,
    Custom,
}

/// Widget bounds in screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RenderRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl RenderRect {
    #[must_use]
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// RGBA color, 8 bits per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl RenderColor {
    pub const TRANSPARENT: Self = Self::rgba(0, 0, 0, 0);

    #[must_use]
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

/// Content to load into a widget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentParameters {
    pub source_type: ContentSourceType,
    pub source_url: String,
    pub template_path: String,
    pub auth_token: String,
    pub refresh_interval_ms: u32,
    pub cache_enabled: bool,
    pub custom_headers: Vec<(String, String)>,
    pub parameters: Vec<(String, String)>,
}

impl Default for ContentParameters {
    fn default() -> Self {
        Self {
            source_type: ContentSourceType::Static,
            source_url: String::new(),
            template_path: String::new(),
            auth_token: String::new(),
            refresh_interval_ms: 0,
            cache_enabled: true,
            custom_headers: Vec::new(),
            parameters: Vec::new(),
        }
    }
}

/// Presentation properties of a widget window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderProperties {
    pub opacity: f32,
    pub visible: bool,
    pub click_through: bool,
    pub top_most: bool,
    pub background_color: RenderColor,
    pub z_order: i32,
    pub enable_animations: bool,
    pub target_fps: u32,
    pub vsync: bool,
    pub scale_x: f32,
    pub scale_y: f32,
    pub rotation: f32,
    pub blur: bool,
    pub blur_radius: f32,
    pub shadow: bool,
    pub shadow_color: RenderColor,
    pub shadow_offset_x: f32,
    pub shadow_offset_y: f32,
}

impl Default for RenderProperties {
    fn default() -> Self {
        Self {
            opacity: 1.0,
            visible: true,
            click_through: false,
            top_most: false,
            background_color: RenderColor::TRANSPARENT,
            z_order: 0,
            enable_animations: true,
            target_fps: 60,
            vsync: true,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            blur: false,
            blur_radius: 0.0,
            shadow: false,
            shadow_color: RenderColor::rgba(0, 0, 0, 128),
            shadow_offset_x: 2.0,
            shadow_offset_y: 2.0,
        }
    }
}

/// A single command for the renderer process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderCommand {
    /// Assigned by the bridge when sent
    pub command_id: u64,
    pub command_type: CommandType,
    pub widget_id: u32,
    /// Native window handle the widget renders into (0 for none)
    pub window_handle: u64,
    pub backend_type: BackendType,
    pub bounds: RenderRect,
    pub content: ContentParameters,
    pub properties: RenderProperties,
    pub timestamp: u64,
}

impl RenderCommand {
    #[must_use]
    pub fn new(command_type: CommandType, widget_id: u32) -> Self {
        Self {
            command_id: 0,
            command_type,
            widget_id,
            window_handle: 0,
            backend_type: BackendType::Auto,
            bounds: RenderRect::default(),
            content: ContentParameters::default(),
            properties: RenderProperties::default(),
            timestamp: now_millis(),
        }
    }

    #[must_use]
    pub fn with_bounds(mut self, bounds: RenderRect) -> Self {
        self.bounds = bounds;
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend_type = backend;
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: ContentParameters) -> Self {
        self.content = content;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: RenderProperties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn with_window_handle(mut self, handle: u64) -> Self {
        self.window_handle = handle;
        self
    }
}

/// Encode a command
pub fn encode_command(command: &RenderCommand) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(command)?)
}

/// Decode a command
pub fn decode_command(data: &[u8]) -> Result<RenderCommand> {
    Ok(rmp_serde::from_slice(data)?)
}

/// Encode a result
pub fn encode_result(result: &RenderResult) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(result)?)
}

/// Decode a result
pub fn decode_result(data: &[u8]) -> Result<RenderResult> {
    Ok(rmp_serde::from_slice(data)?)
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResultStatus;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_survives_msgpack() {
        let mut content = ContentParameters {
            source_type: ContentSourceType::Web,
            source_url: "https://example.invalid/feed".into(),
            ..ContentParameters::default()
        };
        content
            .custom_headers
            .push(("Authorization".into(), "Bearer x".into()));
        content.parameters.push(("city".into(), "Oslo".into()));

        let mut command = RenderCommand::new(CommandType::UpdateContent, 7)
            .with_bounds(RenderRect::new(10, 20, 300, 200))
            .with_backend(BackendType::WebEmbed)
            .with_content(content);
        command.command_id = 42;

        let bytes = encode_command(&command).unwrap();
        assert_eq!(decode_command(&bytes).unwrap(), command);
    }

    #[test]
    fn result_decodes_what_was_encoded() {
        let result = RenderResult::failure(9, 3, "backend missing")
            .with_status(ResultStatus::BackendNotSupported);
        let bytes = encode_result(&result).unwrap();
        let decoded = decode_result(&bytes).unwrap();
        assert_eq!(decoded.command_id, 9);
        assert_eq!(decoded.status, ResultStatus::BackendNotSupported);
        assert_eq!(decoded.error_message, "backend missing");
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_command(&[0xc1, 0x00, 0xff]).unwrap_err();
        assert!(matches!(err, crate::RenderwardError::Decode(_)));
    }

    #[test]
    fn default_properties_match_renderer_expectations() {
        let props = RenderProperties::default();
        assert!((props.opacity - 1.0).abs() < f32::EPSILON);
        assert_eq!(props.target_fps, 60);
        assert!(props.visible);
        assert_eq!(props.background_color, RenderColor::TRANSPARENT);
    }
}
