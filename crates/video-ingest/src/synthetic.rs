//! Camera backends that do not need hardware: a generated test pattern and a
//! still image replayed as a live feed.

use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::debug;

use crate::{
    backend::{CameraBackend, CaptureDevice},
    types::{CameraError, CaptureError, CaptureRequest, Frame, FrameFormat, Resolution},
};

/// Moving colour gradient at a fixed resolution.
#[derive(Clone, Debug)]
pub struct TestPatternBackend {
    resolution: Option<Resolution>,
}

impl TestPatternBackend {
    /// Pattern with a fixed size, regardless of the requested resolution.
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution: Some(resolution),
        }
    }

    /// Pattern sized to whatever the request asks for.
    pub fn matching_request() -> Self {
        Self { resolution: None }
    }
}

impl CameraBackend for TestPatternBackend {
    fn device_name(&self) -> String {
        "test-pattern".into()
    }

    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let resolution = self.resolution.unwrap_or(request.ideal_resolution);
        if resolution.is_empty() {
            return Err(CameraError::unavailable(
                self.device_name(),
                format!("cannot generate a {resolution} pattern"),
            ));
        }
        Ok(Box::new(TestPatternDevice {
            resolution,
            pacer: Pacer::new(request.fps),
            tick: 0,
        }))
    }
}

struct TestPatternDevice {
    resolution: Resolution,
    pacer: Pacer,
    tick: u32,
}

impl CaptureDevice for TestPatternDevice {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        self.pacer.wait();
        self.tick = self.tick.wrapping_add(1);

        let Resolution { width, height } = self.resolution;
        let mut data = Vec::with_capacity(self.resolution.pixel_count() * 3);
        let shift = self.tick.wrapping_mul(4);
        let span = width.max(1);
        for y in 0..height {
            for x in 0..width {
                data.push((x.wrapping_add(shift) % span * 255 / span) as u8);
                data.push((y * 255 / height.max(1)) as u8);
                data.push((shift % 256) as u8);
            }
        }

        Ok(Frame {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Rgb8,
        })
    }
}

/// Decodes a JPEG/PNG once and serves it as every frame of the stream.
#[derive(Clone, Debug)]
pub struct StillImageBackend {
    path: PathBuf,
}

impl StillImageBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CameraBackend for StillImageBackend {
    fn device_name(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let bytes = std::fs::read(&self.path)
            .map_err(|err| CameraError::from_io(self.device_name(), &err))?;
        let image = image::load_from_memory(&bytes)
            .map_err(|err| CameraError::unavailable(self.device_name(), err))?
            .to_rgb8();
        debug!(
            path = %self.path.display(),
            width = image.width(),
            height = image.height(),
            "still image source opened"
        );
        Ok(Box::new(StillImageDevice {
            width: image.width(),
            height: image.height(),
            data: image.into_raw(),
            pacer: Pacer::new(request.fps),
        }))
    }
}

struct StillImageDevice {
    width: u32,
    height: u32,
    data: Vec<u8>,
    pacer: Pacer,
}

impl CaptureDevice for StillImageDevice {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        self.pacer.wait();
        Ok(Frame {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Rgb8,
        })
    }
}

/// Sleeps just long enough to hold a target frame rate.
struct Pacer {
    interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    fn new(fps: f64) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
        Self {
            interval: Duration::from_secs_f64(1.0 / fps),
            last: None,
        }
    }

    fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_frames_match_resolution() {
        let backend = TestPatternBackend::new(Resolution::new(16, 9));
        let mut device = backend.open(&CaptureRequest::default()).unwrap();
        let frame = device.read_frame().unwrap();
        assert_eq!(frame.resolution(), Resolution::new(16, 9));
        assert_eq!(frame.data.len(), frame.expected_len());
    }

    #[test]
    fn test_pattern_follows_request_when_unsized() {
        let backend = TestPatternBackend::matching_request();
        let request = CaptureRequest {
            ideal_resolution: Resolution::new(32, 24),
            ..CaptureRequest::default()
        };
        let mut device = backend.open(&request).unwrap();
        assert_eq!(
            device.read_frame().unwrap().resolution(),
            Resolution::new(32, 24)
        );
    }

    #[test]
    fn test_still_image_replays_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shelf.png");
        image::RgbImage::from_pixel(20, 10, image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        let backend = StillImageBackend::new(&path);
        let mut device = backend.open(&CaptureRequest::default()).unwrap();
        let frame = device.read_frame().unwrap();
        assert_eq!(frame.resolution(), Resolution::new(20, 10));
        assert_eq!(&frame.data[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_missing_still_image_is_unavailable() {
        let backend = StillImageBackend::new("/definitely/not/here.jpg");
        let err = backend.open(&CaptureRequest::default()).err().unwrap();
        assert!(matches!(err, CameraError::DeviceUnavailable { .. }));
    }
}
