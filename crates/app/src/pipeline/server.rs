//! Actix Web surface: the MJPEG stream, frame snapshots, status JSON, SSE
//! detection events, and the Prometheus exposition.
//!
//! The server runs on a dedicated thread so the frame path never touches the
//! async runtime. Every stream client ticks on its own timer against the
//! shared latest-frame slot; a slow client skips frames without affecting
//! anyone else.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde::Serialize;
use serde_json::to_string;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::error;

use crate::pipeline::{
    data::{DefectCounters, DetectionsResponse, FramePacket, SharedFrame, StateCell},
    telemetry,
};

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) latest: SharedFrame,
    pub(crate) state: Arc<StateCell>,
    pub(crate) counters: Arc<DefectCounters>,
    pub(crate) stream_interval: Duration,
}

#[derive(Default)]
/// Handle for the API server thread.
pub(crate) struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    state: &'static str,
    fps: f32,
    frame_number: u64,
    frames_captured: u64,
    frames_dropped: u64,
    defects_admitted: u64,
    defects_suppressed: u64,
    store_dropped: u64,
}

/// Spawn the API server thread and return a handle that can stop it.
pub(crate) fn spawn_api_server(
    bind: std::net::SocketAddr,
    latest: SharedFrame,
    state: Arc<StateCell>,
    counters: Arc<DefectCounters>,
    stream_fps_cap: u32,
) -> Result<ApiServer> {
    let stream_interval = Duration::from_secs(1) / stream_fps_cap.max(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("linewatch-api".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState {
                            latest: latest.clone(),
                            state: state.clone(),
                            counters: counters.clone(),
                            stream_interval,
                        }))
                        .route("/stream.mjpg", web::get().to(stream_handler))
                        .route("/frame.jpg", web::get().to(frame_handler))
                        .route("/api/status", web::get().to(status_handler))
                        .route("/api/defects", web::get().to(defects_handler))
                        .route("/api/events", web::get().to(events_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                })
                .bind(bind)?
                .run();

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
        .context("Failed to spawn API server thread")?;
    Ok(ApiServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Connected-client gauge that decrements itself when a stream ends.
struct ClientGauge;

impl ClientGauge {
    fn connect() -> Self {
        metrics::gauge!("linewatch_stream_clients").increment(1.0);
        Self
    }
}

impl Drop for ClientGauge {
    fn drop(&mut self) {
        metrics::gauge!("linewatch_stream_clients").decrement(1.0);
    }
}

/// Fetch the latest encoded frame from the shared slot.
fn latest_frame(shared: &SharedFrame) -> Option<FramePacket> {
    match shared.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    }
}

/// Return the latest frame as a plain JPEG.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match latest_frame(&state.latest) {
        Some(packet) => HttpResponse::Ok()
            .append_header(("X-Sequence", packet.frame_number.to_string()))
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::NotFound().finish(),
    }
}

/// Stream the MJPEG feed over a multipart response.
///
/// Each client samples the latest-frame slot at the stream rate and only
/// receives frames it has not seen; missed ticks are skipped rather than
/// bursted so a stalled peer drops frames instead of accumulating them.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let _client = ClientGauge::connect();
        let mut interval = actix_web::rt::time::interval(state.stream_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_sent: Option<u64> = None;
        loop {
            interval.tick().await;
            let frame = latest_frame(&state.latest);
            if let Some(packet) = frame {
                if last_sent == Some(packet.frame_number) {
                    continue;
                }
                last_sent = Some(packet.frame_number);
                let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
                payload.extend_from_slice(b"--frame\r\n");
                payload.extend_from_slice(
                    format!("X-Sequence: {}\r\n", packet.frame_number).as_bytes(),
                );
                payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
                payload.extend_from_slice(&packet.jpeg);
                payload.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Pipeline state and throughput snapshot.
async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let (fps, frame_number) = latest_frame(&state.latest)
        .map(|packet| (packet.fps, packet.frame_number))
        .unwrap_or((0.0, 0));
    HttpResponse::Ok().json(StatusResponse {
        state: state.state.get().as_str(),
        fps,
        frame_number,
        frames_captured: state.counters.frames(),
        frames_dropped: state.counters.frames_dropped(),
        defects_admitted: state.counters.total_admitted(),
        defects_suppressed: state.counters.total_suppressed(),
        store_dropped: state.counters.store_dropped(),
    })
}

/// Per-class admitted totals.
async fn defects_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.counters.counts())
}

/// Stream detection snapshots as Server-Sent Events, one per encoded frame.
async fn events_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(250));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_sent: Option<u64> = None;
        loop {
            interval.tick().await;
            let snapshot = latest_frame(&state.latest);
            match snapshot {
                Some(packet) if last_sent != Some(packet.frame_number) => {
                    last_sent = Some(packet.frame_number);
                    let payload = DetectionsResponse {
                        timestamp_ms: packet.timestamp_ms,
                        frame_number: packet.frame_number,
                        fps: packet.fps,
                        detections: &packet.detections,
                    };
                    match to_string(&payload) {
                        Ok(json) => {
                            let mut sse_chunk = String::with_capacity(json.len() + 32);
                            sse_chunk.push_str("id: ");
                            sse_chunk.push_str(&packet.frame_number.to_string());
                            sse_chunk.push('\n');
                            sse_chunk.push_str("data: ");
                            sse_chunk.push_str(&json);
                            sse_chunk.push_str("\n\n");
                            yield Ok::<Bytes, actix_web::Error>(Bytes::from(sse_chunk));
                        }
                        Err(err) => {
                            let error_chunk = format!("event: error\ndata: {}\n\n", err);
                            yield Ok::<Bytes, actix_web::Error>(Bytes::from(error_chunk));
                        }
                    }
                }
                _ => {
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": keep-alive\n\n"));
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

/// Prometheus exposition.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}
