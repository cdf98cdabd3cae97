//! The capture → sample → detect → overlay loop.
//!
//! [`Orchestrator`] owns the camera, the sampler, the overlay and the result
//! gate, and runs on a single-threaded runtime. Control arrives as
//! [`Command`]s through a [`PipelineHandle`]; everything observable leaves as
//! [`PipelineEvent`]s on a broadcast channel and as a [`PreviewState`]
//! snapshot on a watch channel.

pub mod config;
mod gate;
pub mod telemetry;
pub mod watchdog;

use std::{sync::Arc, time::Duration};

use image::RgbaImage;
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinSet,
};
use tracing::{debug, info, info_span, warn};
use video_ingest::{
    CameraBackend, CameraError, Resolution, SessionId, StreamEvent, StreamManager, StreamSession,
};

pub use self::gate::{DiscardReason, ResultGate};
use self::{
    config::PipelineConfig,
    watchdog::{CaptureWatchdog, current_millis},
};
use crate::{
    client::{DetectionClient, DetectionError, DetectionService, HealthStatus},
    detection::{Detection, DetectionResult},
    overlay::OverlayRenderer,
    sampler::FrameSampler,
};

const COMMAND_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 64;

/// Control requests accepted by the orchestrator.
#[derive(Debug)]
pub enum Command {
    Start {
        reply: Option<oneshot::Sender<Result<SessionId, CameraError>>>,
    },
    Stop {
        reply: Option<oneshot::Sender<Option<SessionId>>>,
    },
    Shutdown,
}

/// Everything the loop reports to the outside.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    SessionStarted {
        session: SessionId,
        device: String,
    },
    MetadataReady {
        session: SessionId,
        resolution: Resolution,
    },
    SessionEnded {
        session: SessionId,
    },
    /// Acquisition failed (`session` is `None`) or the device failed mid-session.
    CameraFailed {
        session: Option<SessionId>,
        error: CameraError,
    },
    /// A sample was taken but not sent because a request was outstanding.
    FrameDropped {
        session: SessionId,
        sequence: u64,
    },
    ResultApplied(Arc<DetectionResult>),
    ResultDiscarded {
        session: SessionId,
        sequence: u64,
        reason: DiscardReason,
    },
    DetectionFailed {
        session: SessionId,
        sequence: u64,
        error: Arc<DetectionError>,
    },
    CaptureStalled {
        session: SessionId,
        silent: Duration,
    },
}

/// Latest state for preview surfaces.
#[derive(Clone, Debug, Default)]
pub struct PreviewState {
    pub session: Option<StreamSession>,
    /// Last applied result of the current session.
    pub result: Option<Arc<DetectionResult>>,
    /// Overlay rendered for `result`, at the session resolution.
    pub overlay: Option<Arc<RgbaImage>>,
    /// Operator-facing message of the last camera failure.
    pub camera_error: Option<String>,
}

impl PreviewState {
    pub fn detections(&self) -> &[Detection] {
        self.result
            .as_deref()
            .map(|result| result.detections.as_slice())
            .unwrap_or_default()
    }
}

/// A detection request that has finished, successfully or not.
#[derive(Debug)]
pub struct Settled {
    pub session: SessionId,
    pub sequence: u64,
    pub outcome: Result<Vec<Detection>, DetectionError>,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("the detection loop is not running")]
    Closed,
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// Cloneable handle for controlling and observing a running [`Orchestrator`].
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::Sender<Command>,
    preview: watch::Receiver<PreviewState>,
    events: broadcast::Sender<PipelineEvent>,
    client: DetectionClient,
}

impl PipelineHandle {
    pub async fn start(&self) -> Result<SessionId, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { reply: Some(tx) })
            .await
            .map_err(|_| ControlError::Closed)?;
        Ok(rx.await.map_err(|_| ControlError::Closed)??)
    }

    pub async fn stop(&self) -> Result<Option<SessionId>, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply: Some(tx) })
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    /// Ask the loop to exit. Safe to call from any thread; returns `false` if
    /// the request could not be queued.
    pub fn shutdown(&self) -> bool {
        self.commands.try_send(Command::Shutdown).is_ok()
    }

    pub fn preview(&self) -> PreviewState {
        self.preview.borrow().clone()
    }

    pub fn watch_preview(&self) -> watch::Receiver<PreviewState> {
        self.preview.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn in_flight(&self) -> watch::Receiver<bool> {
        self.client.subscribe_in_flight()
    }

    pub async fn health(&self) -> HealthStatus {
        self.client.health().await
    }
}

/// Owns the session and everything derived from it.
pub struct Orchestrator {
    config: PipelineConfig,
    streams: StreamManager,
    stream_events: mpsc::UnboundedReceiver<StreamEvent>,
    client: DetectionClient,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<PipelineEvent>,
    preview: watch::Sender<PreviewState>,
    session: Option<StreamSession>,
    sampler: Option<FrameSampler>,
    renderer: Option<OverlayRenderer>,
    watchdog: Option<CaptureWatchdog>,
    gate: ResultGate,
    requests: JoinSet<Settled>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        service: Arc<dyn DetectionService>,
        config: PipelineConfig,
    ) -> (Self, PipelineHandle) {
        let (streams, stream_events) = StreamManager::new(backend);
        let client = DetectionClient::new(service);
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (preview, preview_rx) = watch::channel(PreviewState::default());

        let handle = PipelineHandle {
            commands: command_tx,
            preview: preview_rx,
            events: events.clone(),
            client: client.clone(),
        };
        let orchestrator = Self {
            config,
            streams,
            stream_events,
            client,
            commands,
            events,
            preview,
            session: None,
            sampler: None,
            renderer: None,
            watchdog: None,
            gate: ResultGate::default(),
            requests: JoinSet::new(),
        };
        (orchestrator, handle)
    }

    pub fn session(&self) -> Option<&StreamSession> {
        self.session.as_ref()
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.is_some()
    }

    pub fn renderer(&self) -> Option<&OverlayRenderer> {
        self.renderer.as_ref()
    }

    pub fn client(&self) -> &DetectionClient {
        &self.client
    }

    /// Drive the loop until shutdown is requested or every handle is gone.
    pub async fn run(mut self) {
        info!("detection loop running");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start { reply }) => {
                        let outcome = self.start_session().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(outcome);
                        }
                    }
                    Some(Command::Stop { reply }) => {
                        let stopped = self.stop_session();
                        if let Some(reply) = reply {
                            let _ = reply.send(stopped);
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = self.stream_events.recv() => self.on_stream_event(event),
                _ = next_tick(&mut self.sampler) => self.on_tick(),
                Some(joined) = self.requests.join_next(), if !self.requests.is_empty() => {
                    match joined {
                        Ok(settled) => self.on_settled(settled),
                        Err(err) => warn!("detection task ended abnormally: {err}"),
                    }
                }
            }
        }

        self.stop_session();
        self.requests.shutdown().await;
        info!("detection loop stopped");
    }

    /// Acquire the camera for a new session, ending any current one first.
    pub async fn start_session(&mut self) -> Result<SessionId, CameraError> {
        self.stop_session();

        match self.streams.start(&self.config.capture).await {
            Ok(session) => {
                let id = session.id();
                self.gate.begin(id);
                self.session = Some(session.clone());
                self.emit(PipelineEvent::SessionStarted {
                    session: id,
                    device: session.device().to_string(),
                });
                self.preview.send_modify(|state| {
                    *state = PreviewState {
                        session: Some(session),
                        ..PreviewState::default()
                    };
                });
                Ok(id)
            }
            Err(err) => {
                warn!("camera start failed: {err}");
                metrics::counter!("vision_camera_errors_total").increment(1);
                self.preview.send_modify(|state| {
                    state.camera_error = Some(err.user_message().to_string());
                });
                self.emit(PipelineEvent::CameraFailed {
                    session: None,
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    /// End the current session: the timer stops here, the device is released
    /// and results still in flight will be discarded when they settle.
    pub fn stop_session(&mut self) -> Option<SessionId> {
        self.sampler = None;
        self.watchdog = None;
        self.renderer = None;
        self.gate.end();
        self.session = None;

        let stopped = self.streams.stop();
        if let Some(session) = stopped {
            self.preview.send_modify(|state| {
                state.session = None;
                state.result = None;
                state.overlay = None;
            });
            self.emit(PipelineEvent::SessionEnded { session });
        }
        stopped
    }

    /// Wait for the next camera lifecycle event.
    pub async fn next_stream_event(&mut self) -> Option<StreamEvent> {
        self.stream_events.recv().await
    }

    pub fn on_stream_event(&mut self, event: StreamEvent) {
        let current = self.session.as_ref().map(StreamSession::id);
        match event {
            StreamEvent::MetadataReady {
                session,
                resolution,
            } if Some(session) == current => {
                let Some(stream) = self.session.clone() else {
                    return;
                };
                info!(%session, %resolution, "session resolution known; sampling");
                self.sampler = Some(FrameSampler::new(
                    stream,
                    resolution,
                    self.config.sample_interval,
                    self.config.jpeg_quality,
                ));
                self.renderer = Some(OverlayRenderer::new(resolution));
                self.watchdog = Some(CaptureWatchdog::new(session, self.config.stall_threshold));
                self.emit(PipelineEvent::MetadataReady {
                    session,
                    resolution,
                });
            }
            StreamEvent::Failed { session, error } if Some(session) == current => {
                warn!(%session, "camera failed: {error}");
                metrics::counter!("vision_camera_errors_total").increment(1);
                self.stop_session();
                self.preview.send_modify(|state| {
                    state.camera_error = Some(error.user_message().to_string());
                });
                self.emit(PipelineEvent::CameraFailed {
                    session: Some(session),
                    error,
                });
            }
            other => debug!(?other, "stream event for an inactive session"),
        }
    }

    /// One sampling tick: check the capture, sample, and dispatch if idle.
    pub fn on_tick(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let id = session.id();
        let _span = info_span!("sample.tick", session = %id).entered();

        if let Some(watchdog) = self.watchdog.as_mut() {
            if let Some(silent) = watchdog.check(session.feed(), current_millis()) {
                let _ = self.events.send(PipelineEvent::CaptureStalled {
                    session: id,
                    silent,
                });
            }
        }

        let Some(sampler) = self.sampler.as_mut() else {
            return;
        };
        let frame = match sampler.sample() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                warn!("failed to sample frame: {err}");
                metrics::counter!("vision_sample_errors_total").increment(1);
                return;
            }
        };

        let (session, sequence) = (frame.session, frame.sequence);
        let frame_age_ms = current_millis().saturating_sub(frame.captured_at_ms);
        match self.client.submit(frame) {
            Some(pending) => {
                debug!(sequence, frame_age_ms, "detection request dispatched");
                self.requests.spawn(async move {
                    let outcome = pending.await.map(|result| result.detections);
                    Settled {
                        session,
                        sequence,
                        outcome,
                    }
                });
            }
            None => self.emit(PipelineEvent::FrameDropped { session, sequence }),
        }
    }

    /// Wait for the next outstanding request to settle.
    pub async fn next_settled(&mut self) -> Option<Settled> {
        loop {
            match self.requests.join_next().await? {
                Ok(settled) => return Some(settled),
                Err(err) => warn!("detection task ended abnormally: {err}"),
            }
        }
    }

    /// Apply, discard or report a settled request.
    pub fn on_settled(&mut self, settled: Settled) {
        let Settled {
            session,
            sequence,
            outcome,
        } = settled;

        let detections = match outcome {
            Ok(detections) => detections,
            Err(err) => {
                metrics::counter!("vision_detection_errors_total").increment(1);
                if self.gate.session() != Some(session) {
                    debug!(%session, sequence, "ignoring failure from an ended session: {err}");
                    return;
                }
                warn!(%session, sequence, "detection failed: {err}");
                self.emit(PipelineEvent::DetectionFailed {
                    session,
                    sequence,
                    error: Arc::new(err),
                });
                return;
            }
        };

        if let Err(reason) = self.gate.admit(session, sequence) {
            metrics::counter!("vision_results_discarded_total", "reason" => reason.to_string())
                .increment(1);
            debug!(%session, sequence, %reason, "detection result discarded");
            self.emit(PipelineEvent::ResultDiscarded {
                session,
                sequence,
                reason,
            });
            return;
        }

        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        renderer.render(&detections);
        let overlay = Arc::new(renderer.surface().clone());
        let result = Arc::new(DetectionResult {
            session,
            sequence,
            detections,
        });

        metrics::counter!("vision_results_applied_total").increment(1);
        metrics::gauge!("vision_detections_on_screen").set(result.detections.len() as f64);
        debug!(%session, sequence, count = result.detections.len(), "detection result applied");

        self.preview.send_modify(|state| {
            state.result = Some(result.clone());
            state.overlay = Some(overlay);
        });
        self.emit(PipelineEvent::ResultApplied(result));
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_tick(sampler: &mut Option<FrameSampler>) {
    match sampler {
        Some(sampler) => sampler.tick().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use video_ingest::TestPatternBackend;

    use super::*;
    use crate::detection::BoundingBox;

    /// Service that answers each request with the next scripted outcome,
    /// optionally holding it until released.
    #[derive(Default)]
    struct ScriptedService {
        script: Mutex<Vec<Result<Vec<Detection>, DetectionError>>>,
        hold: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl ScriptedService {
        fn answering(outcomes: Vec<Result<Vec<Detection>, DetectionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes),
                hold: Mutex::new(None),
            })
        }

        fn hold_next(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            *self.hold.lock().unwrap() = Some(rx);
            tx
        }
    }

    #[async_trait]
    impl DetectionService for ScriptedService {
        async fn detect(&self, _jpeg: Bytes) -> Result<Vec<Detection>, DetectionError> {
            let hold = self.hold.lock().unwrap().take();
            if let Some(hold) = hold {
                let _ = hold.await;
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Ok(Vec::new());
            }
            script.remove(0)
        }

        async fn health(&self) -> Result<HealthStatus, DetectionError> {
            Ok(HealthStatus {
                status: "ok".into(),
                ml_engine: "scripted".into(),
            })
        }
    }

    fn bottle() -> Detection {
        Detection::new("bottle", 0.93, BoundingBox::new(50.0, 60.0, 180.0, 300.0))
    }

    fn orchestrator(service: Arc<ScriptedService>) -> (Orchestrator, PipelineHandle) {
        Orchestrator::new(
            Arc::new(TestPatternBackend::new(Resolution::new(320, 240))),
            service,
            PipelineConfig::default(),
        )
    }

    async fn start_and_await_metadata(orch: &mut Orchestrator) -> SessionId {
        let id = orch.start_session().await.unwrap();
        loop {
            let event = orch.next_stream_event().await.unwrap();
            let ready =
                matches!(event, StreamEvent::MetadataReady { session, .. } if session == id);
            orch.on_stream_event(event);
            if ready {
                break;
            }
        }
        let feed = orch.session().unwrap().feed().clone();
        while feed.latest().is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        id
    }

    #[tokio::test]
    async fn test_no_sampling_before_metadata() {
        let (mut orch, _handle) = orchestrator(ScriptedService::answering(vec![]));
        orch.start_session().await.unwrap();
        assert!(!orch.is_sampling());
        orch.on_tick();
        assert!(!orch.client().in_flight());
        orch.stop_session();
    }

    #[tokio::test]
    async fn test_busy_tick_drops_frame() {
        let service = ScriptedService::answering(vec![Ok(vec![bottle()])]);
        let release = service.hold_next();
        let (mut orch, handle) = orchestrator(service);
        let mut events = handle.subscribe();
        let session = start_and_await_metadata(&mut orch).await;

        orch.on_tick();
        assert!(orch.client().in_flight());
        orch.on_tick();

        let mut dropped = None;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::FrameDropped { sequence, .. } = event {
                dropped = Some(sequence);
            }
        }
        assert_eq!(dropped, Some(2));

        let _ = release.send(());
        let settled = orch.next_settled().await.unwrap();
        assert_eq!((settled.session, settled.sequence), (session, 1));
        orch.on_settled(settled);
        assert!(!orch.client().in_flight());
        assert_eq!(handle.preview().result.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_error_keeps_last_good_overlay() {
        let service = ScriptedService::answering(vec![
            Ok(vec![bottle()]),
            Err(DetectionError::Status {
                status: 500,
                body: "model crashed".into(),
            }),
        ]);
        let (mut orch, handle) = orchestrator(service);
        let mut events = handle.subscribe();
        start_and_await_metadata(&mut orch).await;

        orch.on_tick();
        let settled = orch.next_settled().await.unwrap();
        orch.on_settled(settled);
        let before = handle.preview();

        orch.on_tick();
        let settled = orch.next_settled().await.unwrap();
        assert!(settled.outcome.is_err());
        orch.on_settled(settled);
        let after = handle.preview();

        assert_eq!(after.result, before.result);
        assert_eq!(
            after.overlay.unwrap().as_raw(),
            before.overlay.unwrap().as_raw()
        );
        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(
                event,
                PipelineEvent::DetectionFailed { sequence: 2, .. }
            );
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_result_after_stop_is_discarded() {
        let service = ScriptedService::answering(vec![Ok(vec![bottle()])]);
        let release = service.hold_next();
        let (mut orch, handle) = orchestrator(service);
        let first = start_and_await_metadata(&mut orch).await;

        orch.on_tick();
        let second = orch.start_session().await.unwrap();
        assert_ne!(first, second);
        assert!(orch.client().in_flight());

        let _ = release.send(());
        let settled = orch.next_settled().await.unwrap();
        assert_eq!(settled.session, first);
        let mut events = handle.subscribe();
        orch.on_settled(settled);

        assert!(handle.preview().result.is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            PipelineEvent::ResultDiscarded {
                reason: DiscardReason::StaleSession,
                ..
            }
        ));
        orch.stop_session();
    }

    #[tokio::test]
    async fn test_stop_clears_preview_and_sampler() {
        let (mut orch, handle) = orchestrator(ScriptedService::answering(vec![Ok(vec![bottle()])]));
        let session = start_and_await_metadata(&mut orch).await;
        orch.on_tick();
        let settled = orch.next_settled().await.unwrap();
        orch.on_settled(settled);
        assert!(handle.preview().overlay.is_some());

        assert_eq!(orch.stop_session(), Some(session));
        assert!(!orch.is_sampling());
        let preview = handle.preview();
        assert!(preview.session.is_none());
        assert!(preview.overlay.is_none());
        assert!(preview.detections().is_empty());
    }

    #[tokio::test]
    async fn test_handle_controls_running_loop() {
        let (orch, handle) = orchestrator(ScriptedService::answering(vec![]));
        let task = tokio::spawn(orch.run());

        let session = handle.start().await.unwrap();
        assert_eq!(handle.preview().session.map(|s| s.id()), Some(session));
        assert_eq!(handle.stop().await.unwrap(), Some(session));
        assert_eq!(handle.health().await.ml_engine, "scripted");

        assert!(handle.shutdown());
        task.await.unwrap();
        assert!(matches!(handle.start().await, Err(ControlError::Closed)));
    }
}
