use crate::types::{CameraError, CaptureError, CaptureRequest, Frame};

/// An opened camera. Dropping it releases the underlying device.
pub trait CaptureDevice: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Knows how to acquire a [`CaptureDevice`] for a request.
pub trait CameraBackend: Send + Sync {
    /// Human readable device name used in logs and errors.
    fn device_name(&self) -> String;

    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, CameraError>;
}
