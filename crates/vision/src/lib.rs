//! Live detection loop: samples camera frames, ships them to a detection
//! service and keeps a coordinate-accurate overlay of the latest result.

pub mod client;
pub mod detection;
pub mod font;
pub mod overlay;
pub mod pipeline;
pub mod sampler;

pub use client::{
    DEFAULT_SERVICE_URL, DetectionClient, DetectionError, DetectionService, HealthStatus,
    HttpDetectionService, PendingDetection, parse_detections,
};
pub use detection::{BoundingBox, Detection, DetectionResult};
pub use overlay::{DrawCommand, OverlayError, OverlayRenderer, OverlayStyle};
pub use pipeline::{
    Command, ControlError, DiscardReason, Orchestrator, PipelineEvent, PipelineHandle,
    PreviewState, ResultGate, Settled,
    config::{PipelineConfig, TelemetryOptions},
};
pub use sampler::{FrameSampler, SampleError, SampledFrame};
