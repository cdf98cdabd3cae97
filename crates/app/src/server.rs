//! Actix Web preview server exposing the composited video, the overlay, the
//! detection feed and session control.
//!
//! The server runs on a dedicated thread so the detection loop's runtime never
//! sees Actix concerns. Handlers only read snapshots published by the loop and
//! send it commands through its handle.

use std::{net::SocketAddr, thread, time::Duration};

use actix_web::{
    App, HttpResponse, HttpResponseBuilder, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde::Serialize;
use serde_json::{json, to_string};
use tokio::sync::oneshot;
use tracing::{error, info};
use vision::{
    ControlError, HealthStatus, PipelineHandle, PreviewState, overlay, pipeline::telemetry,
    sampler,
};

const MJPEG_FRAME_INTERVAL: Duration = Duration::from_millis(100);
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

/// Shared state backing HTTP handlers.
struct ServerState {
    pipeline: PipelineHandle,
    jpeg_quality: u8,
}

/// Handle for the preview server thread.
pub struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the preview server thread and return a handle that can stop it.
pub fn spawn_preview_server(
    bind: SocketAddr,
    pipeline: PipelineHandle,
    jpeg_quality: u8,
) -> Result<PreviewServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = telemetry::spawn_thread("preview-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(ServerState {
                        pipeline: pipeline.clone(),
                        jpeg_quality,
                    }))
                    .configure(routes)
            })
            .workers(1)
            .shutdown_timeout(1)
            .bind(bind)?
            .run();
            info!(%bind, "preview server listening");

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn preview server thread")?;

    Ok(PreviewServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/frame.jpg", web::get().to(frame_handler))
        .route("/overlay.png", web::get().to(overlay_handler))
        .route("/stream.mjpg", web::get().to(stream_handler))
        .route("/detections", web::get().to(detections_handler))
        .route(
            "/stream_detections",
            web::get().to(stream_detections_handler),
        )
        .route("/status", web::get().to(status_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/session/start", web::post().to(start_handler))
        .route("/session/stop", web::post().to(stop_handler));
}

fn with_cors(mut builder: HttpResponseBuilder) -> HttpResponseBuilder {
    builder
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"));
    builder
}

/// Latest captured frame with the current overlay blended on top, as JPEG.
fn composite_jpeg(preview: &PreviewState, quality: u8) -> Result<Option<Vec<u8>>> {
    let Some(frame) = preview.session.as_ref().and_then(|s| s.feed().latest()) else {
        return Ok(None);
    };
    let mut rgb = sampler::frame_to_rgb(&frame)?;
    if let Some(surface) = preview.overlay.as_deref() {
        if surface.dimensions() == rgb.dimensions() {
            overlay::composite(surface, &mut rgb)?;
        }
    }
    Ok(Some(sampler::encode_jpeg(&rgb, quality)?))
}

async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match composite_jpeg(&state.pipeline.preview(), state.jpeg_quality) {
        Ok(Some(jpeg)) => with_cors(HttpResponse::Ok())
            .content_type("image/jpeg")
            .body(jpeg),
        Ok(None) => HttpResponse::NoContent().finish(),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

async fn overlay_handler(state: web::Data<ServerState>) -> HttpResponse {
    let preview = state.pipeline.preview();
    let Some(surface) = preview.overlay.as_deref() else {
        return HttpResponse::NoContent().finish();
    };
    match overlay::encode_png(surface) {
        Ok(png) => with_cors(HttpResponse::Ok())
            .content_type("image/png")
            .body(png),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Stream the composited feed over a multipart response.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(MJPEG_FRAME_INTERVAL);
        loop {
            interval.tick().await;
            let preview = state.pipeline.preview();
            let sequence = preview.result.as_ref().map(|r| r.sequence).unwrap_or(0);
            match composite_jpeg(&preview, state.jpeg_quality) {
                Ok(Some(jpeg)) => {
                    let mut payload = Vec::with_capacity(jpeg.len() + 64);
                    payload.extend_from_slice(b"--frame\r\n");
                    payload.extend_from_slice(format!("X-Sequence: {sequence}\r\n").as_bytes());
                    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
                    payload.extend_from_slice(&jpeg);
                    payload.extend_from_slice(b"\r\n");
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
                }
                Ok(None) => {}
                Err(err) => error!("failed to composite preview frame: {err}"),
            }
        }
    };

    with_cors(HttpResponse::Ok())
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Return the last applied detection result as JSON.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.pipeline.preview().result {
        Some(result) => with_cors(HttpResponse::Ok()).json(&*result),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream applied detection results as Server-Sent Events.
async fn stream_detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    let mut preview = state.pipeline.watch_preview();
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        let mut last_sent = None;
        loop {
            let result = preview.borrow_and_update().result.clone();
            if let Some(result) = result {
                let key = (result.session, result.sequence);
                if last_sent != Some(key) {
                    last_sent = Some(key);
                    match to_string(&*result) {
                        Ok(json) => {
                            let chunk = format!("id: {}\ndata: {json}\n\n", result.sequence);
                            yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                        }
                        Err(err) => {
                            let chunk = format!("event: error\ndata: {err}\n\n");
                            yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                        }
                    }
                }
            }
            match actix_web::rt::time::timeout(SSE_KEEPALIVE, preview.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": keep-alive\n\n"));
                }
            }
        }
    };

    with_cors(HttpResponse::Ok())
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

#[derive(Serialize)]
struct SessionStatus {
    id: u64,
    device: String,
    active: bool,
    resolution: Option<String>,
    frames_captured: u64,
    last_frame_age_ms: Option<i64>,
    last_applied_sequence: Option<u64>,
}

#[derive(Serialize)]
struct StatusResponse {
    session: Option<SessionStatus>,
    in_flight: bool,
    camera_error: Option<String>,
    service: HealthStatus,
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let preview = state.pipeline.preview();
    let now_ms = vision::pipeline::watchdog::current_millis();
    let session = preview.session.as_ref().map(|session| SessionStatus {
        id: session.id().get(),
        device: session.device().to_string(),
        active: session.is_active(),
        resolution: session.resolution().map(|r| r.to_string()),
        frames_captured: session.feed().frames_published(),
        last_frame_age_ms: session.feed().last_frame_at_ms().map(|ts| now_ms - ts),
        last_applied_sequence: preview.result.as_ref().map(|r| r.sequence),
    });
    let in_flight = *state.pipeline.in_flight().borrow();
    let service = state.pipeline.health().await;

    with_cors(HttpResponse::Ok()).json(StatusResponse {
        session,
        in_flight,
        camera_error: preview.camera_error.clone(),
        service,
    })
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().body("metrics recorder not installed"),
    }
}

async fn start_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.pipeline.start().await {
        Ok(session) => with_cors(HttpResponse::Ok()).json(json!({ "session": session.get() })),
        Err(ControlError::Camera(err)) => with_cors(HttpResponse::ServiceUnavailable()).json(json!({
            "error": err.user_message(),
            "detail": err.to_string(),
        })),
        Err(err) => HttpResponse::ServiceUnavailable().json(json!({ "error": err.to_string() })),
    }
}

async fn stop_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.pipeline.stop().await {
        Ok(stopped) => with_cors(HttpResponse::Ok())
            .json(json!({ "stopped": stopped.map(|session| session.get()) })),
        Err(err) => HttpResponse::ServiceUnavailable().json(json!({ "error": err.to_string() })),
    }
}
