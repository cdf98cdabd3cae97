//! Fixed-cadence frame sampling and JPEG encoding.

use std::time::{Duration, Instant};

use bytes::Bytes;
use image::{RgbImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use thiserror::Error;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::trace;
use video_ingest::{Frame, FrameFormat, Resolution, SessionId, StreamSession};

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("frame buffer holds {actual} bytes, {resolution} needs {expected}")]
    Malformed {
        resolution: Resolution,
        expected: usize,
        actual: usize,
    },
    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// An encoded frame tagged with where it came from.
#[derive(Clone, Debug)]
pub struct SampledFrame {
    pub session: SessionId,
    pub sequence: u64,
    pub resolution: Resolution,
    pub jpeg: Bytes,
    pub captured_at_ms: i64,
}

/// Pulls the latest frame of one session on a fixed timer.
///
/// A sampler lives exactly as long as its session is being sampled; dropping
/// it stops the timer. Sequence numbers start at 1 and only advance.
pub struct FrameSampler {
    session: StreamSession,
    resolution: Resolution,
    interval: Interval,
    next_sequence: u64,
    jpeg_quality: u8,
    raster: RgbImage,
}

impl FrameSampler {
    /// The first tick fires one `cadence` after construction. Must be called
    /// from within a tokio runtime.
    pub fn new(
        session: StreamSession,
        resolution: Resolution,
        cadence: Duration,
        jpeg_quality: u8,
    ) -> Self {
        let mut interval = time::interval_at(time::Instant::now() + cadence, cadence);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            session,
            resolution,
            interval,
            next_sequence: 1,
            jpeg_quality: jpeg_quality.clamp(1, 100),
            raster: RgbImage::new(resolution.width, resolution.height),
        }
    }

    /// Sequence number the next successful sample will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Copy the session's current frame into the raster and encode it.
    ///
    /// Returns `Ok(None)` when the session has ended or no frame has been
    /// captured yet; no sequence number is consumed in that case.
    pub fn sample(&mut self) -> Result<Option<SampledFrame>, SampleError> {
        if !self.session.is_active() {
            return Ok(None);
        }
        let Some(frame) = self.session.feed().latest() else {
            return Ok(None);
        };

        let started = Instant::now();
        self.fill_raster(&frame)?;
        let jpeg = encode_jpeg(&self.raster, self.jpeg_quality)?;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        metrics::counter!("vision_frames_sampled_total").increment(1);
        metrics::histogram!("vision_stage_latency_seconds", "stage" => "sample")
            .record(started.elapsed().as_secs_f64());
        trace!(session = %self.session.id(), sequence, bytes = jpeg.len(), "frame sampled");

        Ok(Some(SampledFrame {
            session: self.session.id(),
            sequence,
            resolution: self.resolution,
            jpeg: Bytes::from(jpeg),
            captured_at_ms: frame.timestamp_ms,
        }))
    }

    fn fill_raster(&mut self, frame: &Frame) -> Result<(), SampleError> {
        if frame.resolution() == self.resolution && frame.format == FrameFormat::Rgb8 {
            check_len(frame)?;
            self.raster.copy_from_slice(&frame.data[..frame.expected_len()]);
            return Ok(());
        }
        let rgb = frame_to_rgb(frame)?;
        self.raster = if rgb.dimensions() == (self.resolution.width, self.resolution.height) {
            rgb
        } else {
            image::imageops::resize(
                &rgb,
                self.resolution.width,
                self.resolution.height,
                FilterType::Triangle,
            )
        };
        Ok(())
    }
}

/// Convert a captured frame into an RGB raster of the same size.
pub fn frame_to_rgb(frame: &Frame) -> Result<RgbImage, SampleError> {
    check_len(frame)?;
    let data = &frame.data[..frame.expected_len()];
    let pixels = match frame.format {
        FrameFormat::Rgb8 => data.to_vec(),
        FrameFormat::Bgr8 => bgr_to_rgb(data),
    };
    RgbImage::from_raw(frame.width, frame.height, pixels).ok_or(SampleError::Malformed {
        resolution: frame.resolution(),
        expected: frame.expected_len(),
        actual: frame.data.len(),
    })
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, SampleError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}

fn check_len(frame: &Frame) -> Result<(), SampleError> {
    if frame.data.len() < frame.expected_len() {
        return Err(SampleError::Malformed {
            resolution: frame.resolution(),
            expected: frame.expected_len(),
            actual: frame.data.len(),
        });
    }
    Ok(())
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use video_ingest::{CaptureRequest, StreamEvent, StreamManager, TestPatternBackend};

    use super::*;

    async fn live_session(resolution: Resolution) -> (StreamManager, StreamSession) {
        let (mut manager, mut events) =
            StreamManager::new(Arc::new(TestPatternBackend::new(resolution)));
        let session = manager.start(&CaptureRequest::default()).await.unwrap();
        loop {
            match events.recv().await {
                Some(StreamEvent::MetadataReady { .. }) => break,
                Some(_) => continue,
                None => panic!("stream ended before metadata"),
            }
        }
        while session.feed().latest().is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        (manager, session)
    }

    #[tokio::test]
    async fn test_sequences_start_at_one_and_increase() {
        let res = Resolution::new(32, 24);
        let (mut manager, session) = live_session(res).await;
        let mut sampler = FrameSampler::new(session, res, Duration::from_millis(500), 90);

        let first = sampler.sample().unwrap().unwrap();
        let second = sampler.sample().unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.resolution, res);
        assert_eq!(&first.jpeg[..2], &[0xFF, 0xD8]);

        manager.stop();
        assert!(sampler.sample().unwrap().is_none());
        assert_eq!(sampler.next_sequence(), 3);
    }

    #[tokio::test]
    async fn test_frame_is_resampled_to_session_resolution() {
        let (mut manager, session) = live_session(Resolution::new(64, 48)).await;
        let target = Resolution::new(32, 24);
        let mut sampler = FrameSampler::new(session, target, Duration::from_millis(500), 75);

        let sampled = sampler.sample().unwrap().unwrap();
        let decoded = image::load_from_memory(&sampled.jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_one_cadence() {
        let res = Resolution::new(8, 8);
        let (mut manager, session) = live_session(res).await;
        let mut sampler = FrameSampler::new(session, res, Duration::from_millis(500), 90);

        let start = time::Instant::now();
        sampler.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        sampler.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        manager.stop();
    }

    #[test]
    fn test_bgr_frames_are_swapped() {
        let frame = Frame {
            data: vec![1, 2, 3, 4, 5, 6],
            width: 2,
            height: 1,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        let rgb = frame_to_rgb(&frame).unwrap();
        assert_eq!(rgb.as_raw(), &vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let frame = Frame {
            data: vec![0; 5],
            width: 2,
            height: 1,
            timestamp_ms: 0,
            format: FrameFormat::Rgb8,
        };
        assert!(matches!(
            frame_to_rgb(&frame),
            Err(SampleError::Malformed { expected: 6, actual: 5, .. })
        ));
    }
}
