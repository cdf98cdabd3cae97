//! The `run` subcommand: detection loop plus preview server.

use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use video_ingest::SessionId;
use vision::{
    ControlError, HttpDetectionService, Orchestrator, PipelineEvent, PipelineHandle,
    pipeline::telemetry,
};

use crate::{config::VisionConfig, server::spawn_preview_server};

/// Run until Ctrl+C, serving the preview for the whole lifetime of the loop.
pub fn run(config: VisionConfig) -> Result<()> {
    if let Err(err) = telemetry::init_metrics_recorder() {
        warn!("metrics disabled: {err:#}");
    }

    let backend = config.source.backend()?;
    let service = HttpDetectionService::new(config.service_url.clone(), config.request_timeout)
        .context("failed to build detection service client")?;
    info!(
        source = ?config.source,
        service = %service.base_url(),
        interval_ms = config.pipeline.sample_interval.as_millis() as u64,
        "starting live detection"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let jpeg_quality = config.pipeline.jpeg_quality;
        let (orchestrator, handle) =
            Orchestrator::new(backend, Arc::new(service), config.pipeline);
        install_ctrlc_handler(handle.clone());

        let server = spawn_preview_server(config.bind, handle.clone(), jpeg_quality)?;
        let logger = tokio::spawn(log_events(handle.subscribe()));
        let detection_loop = tokio::spawn(orchestrator.run());

        if config.autostart {
            if autostart(&handle).await.is_none() {
                info!("camera not started; retry with POST /session/start");
            }
        } else {
            info!(bind = %config.bind, "waiting for POST /session/start");
        }

        if let Err(err) = detection_loop.await {
            error!("detection loop task failed: {err}");
        }
        logger.abort();
        server.stop();
        Ok::<(), anyhow::Error>(())
    })
}

/// Open the camera through the running loop. Session start and camera
/// failures reach the log through `log_events`.
async fn autostart(handle: &PipelineHandle) -> Option<SessionId> {
    match handle.start().await {
        Ok(session) => Some(session),
        Err(ControlError::Camera(_)) => None,
        Err(ControlError::Closed) => {
            error!("detection loop exited before the camera could start");
            None
        }
    }
}

fn install_ctrlc_handler(handle: PipelineHandle) {
    static CTRL_HANDLER: Once = Once::new();

    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            if !handle.shutdown() {
                warn!("shutdown already requested");
            }
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

async fn log_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::SessionStarted { session, device } => {
            info!(%session, device = %device, "camera opened");
        }
        PipelineEvent::MetadataReady {
            session,
            resolution,
        } => info!(%session, %resolution, "stream metadata ready, sampling"),
        PipelineEvent::SessionEnded { session } => info!(%session, "camera session ended"),
        PipelineEvent::CameraFailed { session, error } => match session {
            Some(session) => error!(%session, "{}: {error}", error.user_message()),
            None => error!("{}: {error}", error.user_message()),
        },
        PipelineEvent::FrameDropped { session, sequence } => {
            debug!(%session, sequence, "request outstanding, frame dropped");
        }
        PipelineEvent::ResultApplied(result) => info!(
            session = %result.session,
            sequence = result.sequence,
            detections = result.detections.len(),
            "overlay updated"
        ),
        PipelineEvent::ResultDiscarded {
            session,
            sequence,
            reason,
        } => debug!(%session, sequence, %reason, "result discarded"),
        PipelineEvent::DetectionFailed {
            session,
            sequence,
            error,
        } => warn!(%session, sequence, "detection failed: {error}"),
        PipelineEvent::CaptureStalled { session, silent } => {
            warn!(%session, silent_ms = silent.as_millis() as u64, "capture stalled");
        }
    }
}
