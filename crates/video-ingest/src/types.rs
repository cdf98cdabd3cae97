use std::{fmt, io};

use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Number of bytes a well-formed buffer of this size and format holds.
    pub fn expected_len(&self) -> usize {
        self.resolution().pixel_count() * self.format.bytes_per_pixel()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
    Rgb8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 | FrameFormat::Rgb8 => 3,
        }
    }
}

/// Intrinsic pixel dimensions of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Resolution = Resolution::new(1280, 720);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which physical camera the caller would prefer when several are attached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FacingMode {
    /// Front camera, facing the operator.
    User,
    /// Rear camera, facing the scene.
    #[default]
    Environment,
}

/// Parameters handed to a backend when acquiring a device. Everything here is
/// a hint: the session resolution is whatever the first frame reports.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureRequest {
    pub facing: FacingMode,
    pub ideal_resolution: Resolution,
    pub fps: f64,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            facing: FacingMode::Environment,
            ideal_resolution: Resolution::HD,
            fps: 30.0,
        }
    }
}

/// Session-level acquisition failures. Both are fatal to the session and need
/// an explicit restart from the operator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera access to {device} was denied")]
    PermissionDenied { device: String },
    #[error("camera {device} is unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },
}

impl CameraError {
    pub fn unavailable(device: impl Into<String>, reason: impl fmt::Display) -> Self {
        CameraError::DeviceUnavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    /// Classify an OS error raised while touching the device node.
    pub fn from_io(device: impl Into<String>, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied {
                device: device.into(),
            },
            _ => CameraError::unavailable(device, err),
        }
    }

    /// Text suitable for showing to the operator.
    pub fn user_message(&self) -> &'static str {
        match self {
            CameraError::PermissionDenied { .. } => {
                "Could not access camera. Please ensure camera permissions are granted."
            }
            CameraError::DeviceUnavailable { .. } => {
                "No usable camera was found. Check that it is connected and not in use."
            }
        }
    }
}

/// Errors raised by an open device while reading frames.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    Truncated { expected: usize, actual: usize },
    #[error(transparent)]
    Other(#[from] Error),
}
