//! Camera acquisition for the live detection loop.
//!
//! [`StreamManager`] owns the device: it opens a [`CameraBackend`], runs the
//! capture thread that keeps a [`VideoFeed`] filled with the newest frame, and
//! reports lifecycle changes as [`StreamEvent`]s.

mod backend;
#[cfg(feature = "opencv")]
mod camera;
mod feed;
mod manager;
mod synthetic;
mod types;

pub use backend::{CameraBackend, CaptureDevice};
#[cfg(feature = "opencv")]
pub use camera::OpenCvBackend;
pub use feed::VideoFeed;
pub use manager::{SessionId, StreamEvent, StreamManager, StreamSession};
pub use synthetic::{StillImageBackend, TestPatternBackend};
pub use types::{
    CameraError, CaptureError, CaptureRequest, FacingMode, Frame, FrameFormat, Resolution,
};
