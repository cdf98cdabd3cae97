//! Tunables for the orchestrator and its telemetry.

use std::{path::PathBuf, time::Duration};

use video_ingest::CaptureRequest;

use crate::sampler::DEFAULT_JPEG_QUALITY;

/// Interval between sampled frames.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
/// Time without a new captured frame before the capture is reported stalled.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_millis(1_500);

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Camera acquisition hints used for every session.
    pub capture: CaptureRequest,
    pub sample_interval: Duration,
    /// JPEG quality of sampled frames (1-100).
    pub jpeg_quality: u8,
    pub stall_threshold: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureRequest::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing output.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: Option<String>,
}
