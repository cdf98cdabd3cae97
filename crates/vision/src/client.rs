//! Detection service access with a single-request-in-flight gate.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    detection::{Detection, DetectionResult},
    sampler::SampledFrame,
};

pub const DEFAULT_SERVICE_URL: &str = "http://localhost:5000";

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detection request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("detection service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("detection service sent an invalid payload: {0}")]
    InvalidResponse(String),
}

/// Reported by `GET /health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub ml_engine: String,
}

impl HealthStatus {
    /// Stand-in used when the service cannot be reached.
    pub fn offline() -> Self {
        Self {
            status: "offline".into(),
            ml_engine: "none".into(),
        }
    }
}

/// Anything that turns a JPEG into detections.
#[async_trait]
pub trait DetectionService: Send + Sync {
    async fn detect(&self, jpeg: Bytes) -> Result<Vec<Detection>, DetectionError>;
    async fn health(&self) -> Result<HealthStatus, DetectionError>;
}

/// The HTTP detection endpoint (`POST /detect`, `GET /health`).
#[derive(Clone, Debug)]
pub struct HttpDetectionService {
    client: Client,
    base_url: String,
}

impl HttpDetectionService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DetectionError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl DetectionService for HttpDetectionService {
    async fn detect(&self, jpeg: Bytes) -> Result<Vec<Detection>, DetectionError> {
        let part = Part::bytes(jpeg.to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(format!("{}/detect", self.base_url))
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(DetectionError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        parse_detections(&body)
    }

    async fn health(&self) -> Result<HealthStatus, DetectionError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DetectionError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|err| DetectionError::InvalidResponse(err.to_string()))
    }
}

/// Parse a `/detect` body. Anything other than a JSON array is rejected.
pub fn parse_detections(body: &[u8]) -> Result<Vec<Detection>, DetectionError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| DetectionError::InvalidResponse(format!("not JSON: {err}")))?;
    if !value.is_array() {
        return Err(DetectionError::InvalidResponse(format!(
            "expected an array of detections, got {}",
            json_kind(&value)
        )));
    }
    serde_json::from_value(value).map_err(|err| DetectionError::InvalidResponse(err.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A dispatched request. Dropping it before completion releases the
/// in-flight slot just like settling does.
pub type PendingDetection =
    Pin<Box<dyn Future<Output = Result<DetectionResult, DetectionError>> + Send>>;

struct InFlightState {
    busy: AtomicBool,
    watchers: watch::Sender<bool>,
}

impl InFlightState {
    fn try_acquire(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.watchers.send_replace(true);
        Some(InFlightGuard(self.clone()))
    }
}

struct InFlightGuard(Arc<InFlightState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
        self.0.watchers.send_replace(false);
    }
}

/// Sends sampled frames to a [`DetectionService`], never more than one at a
/// time. Frames offered while a request is outstanding are dropped.
#[derive(Clone)]
pub struct DetectionClient {
    service: Arc<dyn DetectionService>,
    in_flight: Arc<InFlightState>,
}

impl DetectionClient {
    pub fn new(service: Arc<dyn DetectionService>) -> Self {
        let (watchers, _) = watch::channel(false);
        Self {
            service,
            in_flight: Arc::new(InFlightState {
                busy: AtomicBool::new(false),
                watchers,
            }),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.busy.load(Ordering::Acquire)
    }

    pub fn subscribe_in_flight(&self) -> watch::Receiver<bool> {
        self.in_flight.watchers.subscribe()
    }

    /// Dispatch `frame` unless a request is already outstanding.
    ///
    /// Returns `None` when the frame was dropped. The in-flight flag is set
    /// before this returns and cleared when the returned future completes or
    /// is dropped.
    pub fn submit(&self, frame: SampledFrame) -> Option<PendingDetection> {
        let Some(guard) = self.in_flight.try_acquire() else {
            metrics::counter!("vision_frames_dropped_total", "reason" => "in_flight").increment(1);
            debug!(
                session = %frame.session,
                sequence = frame.sequence,
                "request in flight; frame dropped"
            );
            return None;
        };

        let service = self.service.clone();
        Some(Box::pin(async move {
            let _guard = guard;
            let started = Instant::now();
            let outcome = service.detect(frame.jpeg).await;
            metrics::histogram!("vision_detection_latency_seconds")
                .record(started.elapsed().as_secs_f64());
            outcome.map(|detections| DetectionResult {
                session: frame.session,
                sequence: frame.sequence,
                detections,
            })
        }))
    }

    /// Probe the service; an unreachable service reports as offline.
    pub async fn health(&self) -> HealthStatus {
        match self.service.health().await {
            Ok(status) => status,
            Err(err) => {
                warn!("detection service health check failed: {err}");
                HealthStatus::offline()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::oneshot;
    use video_ingest::Resolution;

    use super::*;
    use crate::detection::BoundingBox;

    /// Service whose requests complete only when the test releases them.
    #[derive(Default)]
    struct GatedService {
        waiting: Mutex<Vec<oneshot::Sender<Result<Vec<Detection>, DetectionError>>>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl GatedService {
        fn release(&self, outcome: Result<Vec<Detection>, DetectionError>) {
            let tx = self.waiting.lock().unwrap().remove(0);
            let _ = tx.send(outcome);
        }
    }

    #[async_trait]
    impl DetectionService for GatedService {
        async fn detect(&self, _jpeg: Bytes) -> Result<Vec<Detection>, DetectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            self.waiting.lock().unwrap().push(tx);
            rx.await
                .unwrap_or_else(|_| Err(DetectionError::InvalidResponse("abandoned".into())))
        }

        async fn health(&self) -> Result<HealthStatus, DetectionError> {
            Err(DetectionError::Status {
                status: 503,
                body: String::new(),
            })
        }
    }

    fn frame(sequence: u64, session: video_ingest::SessionId) -> SampledFrame {
        SampledFrame {
            session,
            sequence,
            resolution: Resolution::HD,
            jpeg: Bytes::from_static(b"jpeg-bytes"),
            captured_at_ms: 0,
        }
    }

    fn session_id() -> video_ingest::SessionId {
        video_ingest::SessionId::from_raw(1)
    }

    #[tokio::test]
    async fn test_second_submit_is_dropped_while_in_flight() {
        let service = Arc::new(GatedService::default());
        let client = DetectionClient::new(service.clone());
        let session = session_id();
        let mut watch = client.subscribe_in_flight();

        let pending = client.submit(frame(1, session)).unwrap();
        assert!(client.in_flight());
        assert!(*watch.borrow_and_update());
        assert!(client.submit(frame(2, session)).is_none());

        let task = tokio::spawn(pending);
        while service.waiting.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        service.release(Ok(vec![Detection::new(
            "bottle",
            0.93,
            BoundingBox::new(50.0, 60.0, 180.0, 300.0),
        )]));
        let result = task.await.unwrap().unwrap();

        assert_eq!(result.sequence, 1);
        assert_eq!(result.session, session);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert!(!client.in_flight());
        assert!(!*watch.borrow_and_update());
        assert!(client.submit(frame(3, session)).is_some());
    }

    #[tokio::test]
    async fn test_flag_clears_after_failure() {
        let service = Arc::new(GatedService::default());
        let client = DetectionClient::new(service.clone());
        let session = session_id();

        let task = tokio::spawn(client.submit(frame(1, session)).unwrap());
        while service.waiting.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        service.release(Err(DetectionError::Status {
            status: 500,
            body: "boom".into(),
        }));
        assert!(matches!(
            task.await.unwrap(),
            Err(DetectionError::Status { status: 500, .. })
        ));
        assert!(!client.in_flight());
    }

    #[tokio::test]
    async fn test_flag_clears_when_request_is_abandoned() {
        let client = DetectionClient::new(Arc::new(GatedService::default()));
        let session = session_id();
        let pending = client.submit(frame(1, session)).unwrap();
        assert!(client.in_flight());
        drop(pending);
        assert!(!client.in_flight());
    }

    #[tokio::test]
    async fn test_health_falls_back_to_offline() {
        let client = DetectionClient::new(Arc::new(GatedService::default()));
        assert_eq!(client.health().await, HealthStatus::offline());
    }

    #[test]
    fn test_parse_rejects_non_array_bodies() {
        assert!(parse_detections(b"[]").unwrap().is_empty());
        for body in [&b"{\"error\":\"No image sent\"}"[..], b"null", b"42", b"<html>"] {
            assert!(matches!(
                parse_detections(body),
                Err(DetectionError::InvalidResponse(_))
            ));
        }
    }

    #[test]
    fn test_parse_rejects_malformed_entries() {
        let body = br#"[{"label":"bottle","confidence":0.9}]"#;
        assert!(matches!(
            parse_detections(body),
            Err(DetectionError::InvalidResponse(_))
        ));
    }
}
