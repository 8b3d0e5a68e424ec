// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for capture backends

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Represents one physical or virtual camera
///
/// The descriptor set is enumerated once per session initialization and is
/// immutable after capture starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Stable device identifier (e.g. /dev/video0, or a virtual id)
    pub id: String,
    /// Human-readable name for selection controls
    pub label: String,
}

/// Viewport dimensions reported by the embedding surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Orientation implied by these dimensions
    pub fn orientation(&self) -> Orientation {
        Orientation::from_viewport(self.width, self.height)
    }
}

/// Display orientation derived from viewport dimensions
///
/// Orientation only influences the constraints used at the next stream
/// acquisition; a change never forces a restart by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
}

impl Orientation {
    /// Derive orientation by comparing viewport width and height
    pub fn from_viewport(width: u32, height: u32) -> Self {
        if height > width {
            Orientation::Portrait
        } else {
            Orientation::Landscape
        }
    }

    /// Check if this orientation swaps the landscape width/height pair
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Orientation::Portrait)
    }
}

impl std::fmt::Display for Orientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Orientation::Landscape => write!(f, "landscape"),
            Orientation::Portrait => write!(f, "portrait"),
        }
    }
}

/// Pixel format for capture frames
///
/// Backends convert whatever the hardware delivers (YUYV, MJPG, GREY) into
/// one of these two formats before fan-out; the decode engines consume luma
/// and derive it from Rgba when needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit grayscale, one byte per pixel
    Gray8,
    /// 32-bit RGBA, four bytes per pixel
    Rgba,
}

impl PixelFormat {
    /// Bytes per pixel for this format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgba => 4,
        }
    }
}

/// A single frame from the camera
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Pixel payload; rows may carry stride padding
    pub data: Arc<[u8]>,
    pub format: PixelFormat,
    /// Row stride in bytes (may exceed width * bytes_per_pixel)
    pub stride: u32,
    /// Timestamp when the frame was captured (for latency diagnostics)
    pub captured_at: Instant,
}

impl VideoFrame {
    /// Create a Gray8 frame with tight stride from an owned luma buffer
    pub fn gray(width: u32, height: u32, luma: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data: Arc::from(luma.into_boxed_slice()),
            format: PixelFormat::Gray8,
            stride: width,
            captured_at: Instant::now(),
        }
    }

    /// Create an Rgba frame with tight stride from an owned pixel buffer
    pub fn rgba(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data: Arc::from(pixels.into_boxed_slice()),
            format: PixelFormat::Rgba,
            stride: width * 4,
            captured_at: Instant::now(),
        }
    }
}

/// Negotiated stream format
///
/// Width and height stay zero until the backend has finished negotiation;
/// consumers that need a sized surface must wait for non-zero dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl StreamFormat {
    pub fn new(width: u32, height: u32, framerate: u32) -> Self {
        Self {
            width,
            height,
            framerate,
        }
    }

    /// Whether negotiation produced usable dimensions
    pub fn is_ready(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} @ {}fps", self.width, self.height, self.framerate)
    }
}

/// Focus mode advertised or requested on a video track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusMode {
    /// Continuous autofocus (also implies continuous exposure/white-balance)
    Continuous,
    /// Manual focus (exposure/white-balance held as well)
    Manual,
}

/// Hardware capabilities advertised by the primary video track
#[derive(Debug, Clone, Default)]
pub struct TrackCapabilities {
    /// Torch / flashlight LED present and controllable
    pub torch: bool,
    /// Focus modes the track supports
    pub focus_modes: Vec<FocusMode>,
}

impl TrackCapabilities {
    /// Whether the track supports switching to manual focus
    pub fn supports_manual_focus(&self) -> bool {
        self.focus_modes.contains(&FocusMode::Manual)
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types for capture backend operations
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Backend is not available on this system
    NotAvailable(String),
    /// Camera device not found
    DeviceNotFound(String),
    /// Access to the device was denied
    PermissionDenied(String),
    /// Camera is busy or in use
    Busy,
    /// Requested format/constraints not supported
    FormatNotSupported(String),
    /// General I/O error
    Io(String),
    /// Other errors
    Other(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotAvailable(msg) => write!(f, "Backend not available: {}", msg),
            BackendError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            BackendError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            BackendError::Busy => write!(f, "Camera is busy"),
            BackendError::FormatNotSupported(msg) => write!(f, "Format not supported: {}", msg),
            BackendError::Io(msg) => write!(f, "I/O error: {}", msg),
            BackendError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                BackendError::PermissionDenied(err.to_string())
            }
            std::io::ErrorKind::NotFound => BackendError::DeviceNotFound(err.to_string()),
            _ => BackendError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_from_viewport() {
        assert_eq!(
            Orientation::from_viewport(390, 844),
            Orientation::Portrait
        );
        assert_eq!(
            Orientation::from_viewport(1920, 1080),
            Orientation::Landscape
        );
        // Square viewports count as landscape
        assert_eq!(Orientation::from_viewport(800, 800), Orientation::Landscape);
    }

    #[test]
    fn stream_format_readiness() {
        assert!(!StreamFormat::default().is_ready());
        assert!(StreamFormat::new(640, 480, 30).is_ready());
        assert!(!StreamFormat::new(640, 0, 30).is_ready());
    }

    #[test]
    fn io_error_mapping() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ioctl");
        assert!(matches!(
            BackendError::from(denied),
            BackendError::PermissionDenied(_)
        ));
    }
}
