//! OpenCV-backed camera capture.

use std::path::Path;

use chrono::Utc;
use opencv::{
    core::{Mat, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};

use crate::{
    backend::{CameraBackend, CaptureDevice},
    types::{CameraError, CaptureError, CaptureRequest, FacingMode, Frame, FrameFormat},
};

/// V4L device (index or `/dev/videoN`) or any URI OpenCV can open.
#[derive(Clone, Debug)]
pub struct OpenCvBackend {
    uri: String,
}

impl OpenCvBackend {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl CameraBackend for OpenCvBackend {
    fn device_name(&self) -> String {
        match parse_device_index(&self.uri) {
            Some(index) => format!("/dev/video{index}"),
            None => self.uri.clone(),
        }
    }

    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, CameraError> {
        if request.facing == FacingMode::User {
            debug!(
                "V4L does not report camera orientation; using {} as requested",
                self.uri
            );
        }

        probe_device_node(&self.device_name())?;

        let mut cap = open_video_capture(&self.uri)
            .map_err(|err| CameraError::unavailable(self.device_name(), err))?;
        configure_camera(&mut cap, request);

        Ok(Box::new(OpenCvDevice {
            cap,
            frame: Mat::default(),
        }))
    }
}

struct OpenCvDevice {
    cap: VideoCapture,
    frame: Mat,
}

impl CaptureDevice for OpenCvDevice {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        self.cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(Frame {
                data: Vec::new(),
                width: 0,
                height: 0,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            });
        }

        let data = self
            .frame
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame {
            data,
            width: size.width as u32,
            height: size.height as u32,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }
}

/// Fail early with a precise error when the device node is missing or not
/// readable; OpenCV itself only reports "not opened".
fn probe_device_node(device: &str) -> Result<(), CameraError> {
    if !device.starts_with("/dev/") {
        return Ok(());
    }
    match std::fs::File::open(Path::new(device)) {
        Ok(_) => Ok(()),
        Err(err) => Err(CameraError::from_io(device, &err)),
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply the requested resolution hint, frame rate and a compressed pixel format.
fn configure_camera(cap: &mut VideoCapture, request: &CaptureRequest) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(
        videoio::CAP_PROP_FRAME_WIDTH,
        request.ideal_resolution.width as f64,
    );
    let _ = cap.set(
        videoio::CAP_PROP_FRAME_HEIGHT,
        request.ideal_resolution.height as f64,
    );
    let _ = cap.set(videoio::CAP_PROP_FPS, request.fps);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_index() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/videoX"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }

    #[test]
    fn test_missing_node_is_unavailable() {
        let err = probe_device_node("/dev/video-does-not-exist").unwrap_err();
        assert!(matches!(err, CameraError::DeviceUnavailable { .. }));
    }
}
