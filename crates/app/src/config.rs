//! Configuration parsing for the live loop.
//!
//! This module owns translation of CLI arguments into a `VisionConfig` struct
//! which the runtime uses without re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, ValueEnum};
use video_ingest::{
    CameraBackend, CaptureRequest, FacingMode, Resolution, StillImageBackend, TestPatternBackend,
};
use vision::{DEFAULT_SERVICE_URL, PipelineConfig, TelemetryOptions};

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where frames come from.
pub enum SourceKind {
    /// Generated gradient, no hardware needed.
    TestPattern,
    /// A JPEG/PNG replayed as a live feed.
    StillImage(PathBuf),
    /// V4L device index, `/dev/videoN`, or any URI OpenCV can open.
    Device(String),
}

impl SourceKind {
    /// Infer the source kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri == "test-pattern" {
            SourceKind::TestPattern
        } else if let Some(path) = uri.strip_prefix("file:") {
            SourceKind::StillImage(PathBuf::from(path))
        } else {
            SourceKind::Device(uri.to_string())
        }
    }

    pub fn backend(&self) -> Result<Arc<dyn CameraBackend>> {
        match self {
            SourceKind::TestPattern => Ok(Arc::new(TestPatternBackend::matching_request())),
            SourceKind::StillImage(path) => Ok(Arc::new(StillImageBackend::new(path))),
            SourceKind::Device(uri) => device_backend(uri),
        }
    }
}

#[cfg(feature = "opencv")]
fn device_backend(uri: &str) -> Result<Arc<dyn CameraBackend>> {
    Ok(Arc::new(video_ingest::OpenCvBackend::new(uri)))
}

#[cfg(not(feature = "opencv"))]
fn device_backend(uri: &str) -> Result<Arc<dyn CameraBackend>> {
    bail!(
        "camera source {uri:?} needs a build with the `opencv` feature; \
         use `file:<image>` or `test-pattern` instead"
    )
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Facing {
    User,
    #[default]
    Environment,
}

impl From<Facing> for FacingMode {
    fn from(facing: Facing) -> Self {
        match facing {
            Facing::User => FacingMode::User,
            Facing::Environment => FacingMode::Environment,
        }
    }
}

#[derive(Clone, Debug)]
/// Canonical configuration of a `run` invocation.
pub struct VisionConfig {
    pub source: SourceKind,
    /// Base URL of the detection service.
    pub service_url: String,
    pub request_timeout: Duration,
    pub pipeline: PipelineConfig,
    /// Preview server listen address.
    pub bind: SocketAddr,
    /// Start a camera session as soon as the loop is up.
    pub autostart: bool,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct VisionCliArgs {
    /// Camera source: `test-pattern`, `file:<image>`, or a device index / URI.
    #[arg(long = "source", value_name = "URI", default_value = "test-pattern")]
    pub source_uri: String,
    #[command(flatten)]
    pub service: ServiceArgs,
    /// Requested capture width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 1280)]
    pub width: u32,
    /// Requested capture height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 720)]
    pub height: u32,
    /// Preferred camera orientation.
    #[arg(long = "facing", value_enum, default_value_t = Facing::Environment)]
    pub facing: Facing,
    /// Requested capture frame rate.
    #[arg(long = "fps", default_value_t = 30.0)]
    pub fps: f64,
    /// Milliseconds between sampled frames.
    #[arg(long = "interval-ms", value_name = "MS", default_value_t = 500)]
    pub interval_ms: u64,
    /// JPEG quality of sampled frames (1-100).
    #[arg(long = "jpeg-quality", default_value_t = 90)]
    pub jpeg_quality: i32,
    /// Milliseconds without a new frame before the capture is reported stalled.
    #[arg(long = "stall-ms", value_name = "MS", default_value_t = 1_500)]
    pub stall_ms: u64,
    /// Preview server listen address.
    #[arg(long = "bind", value_name = "ADDR", default_value = "0.0.0.0:8080")]
    pub bind: String,
    /// Wait for `POST /session/start` instead of opening the camera at launch.
    #[arg(long = "no-autostart", action = clap::ArgAction::SetTrue)]
    pub no_autostart: bool,
    /// Write a Chrome trace JSON file capturing loop spans.
    #[arg(long = "trace-chrome", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Enable verbose logging (dropped frames, discarded results).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

/// Detection service location shared by every subcommand.
#[derive(Debug, Args)]
pub struct ServiceArgs {
    /// Base URL of the detection service.
    #[arg(long = "service", value_name = "URL", default_value = DEFAULT_SERVICE_URL)]
    pub url: String,
    /// Per-request timeout in milliseconds.
    #[arg(long = "timeout-ms", value_name = "MS", default_value_t = 10_000)]
    pub timeout_ms: u64,
}

impl ServiceArgs {
    pub fn validate(&self) -> Result<(String, Duration)> {
        let url = self.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("--service must be an http:// or https:// URL, got {url:?}");
        }
        if self.timeout_ms == 0 {
            bail!("--timeout-ms must be at least 1");
        }
        Ok((url.to_string(), Duration::from_millis(self.timeout_ms)))
    }
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        let (service_url, request_timeout) = args.service.validate()?;

        if args.width == 0 || args.height == 0 {
            bail!("--width and --height must be positive integers");
        }
        if !args.fps.is_finite() || args.fps <= 0.0 {
            bail!("--fps must be a positive number");
        }
        if args.interval_ms == 0 {
            bail!("--interval-ms must be at least 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.source_uri.trim().is_empty() {
            return Err(anyhow!("--source must not be empty"));
        }
        let bind: SocketAddr = args
            .bind
            .parse()
            .with_context(|| format!("--bind {:?} is not a socket address", args.bind))?;

        let pipeline = PipelineConfig {
            capture: CaptureRequest {
                facing: args.facing.into(),
                ideal_resolution: Resolution::new(args.width, args.height),
                fps: args.fps,
            },
            sample_interval: Duration::from_millis(args.interval_ms),
            jpeg_quality: args.jpeg_quality as u8,
            stall_threshold: Duration::from_millis(args.stall_ms.max(1)),
        };

        Ok(Self {
            source: SourceKind::from_uri(args.source_uri.trim()),
            service_url,
            request_timeout,
            pipeline,
            bind,
            autostart: !args.no_autostart,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                default_filter: Some(if args.verbose { "debug" } else { "info" }.to_string()),
            },
        })
    }
}
