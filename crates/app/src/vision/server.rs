//! Actix Web server exposing the annotated MJPEG stream and its side
//! endpoints.
//!
//! The server runs on a dedicated thread with its own Actix system so the
//! capture and detector threads never share a runtime with client I/O. Each
//! `/video_feed` client is driven by publish notifications from the
//! published-frame slot: idle clients cost nothing and a slow client simply
//! skips to whatever is newest when it is ready for more.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    thread,
    time::Duration,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::vision::{
    data::{DetectionsResponse, PublishedFrame},
    encoding::{STREAM_CONTENT_TYPE, multipart_part},
    slot::PublishedFrameSlot,
    telemetry,
    watchdog::PipelineHealth,
};

/// How long the server waits for the Actix system to bind.
const BIND_TIMEOUT: Duration = Duration::from_secs(10);
/// Streaming responses never finish on their own; cap the graceful drain.
const SHUTDOWN_TIMEOUT_SECS: u64 = 1;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) frames: Arc<PublishedFrameSlot>,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) jpeg_quality: u8,
}

/// Register every route on an Actix app.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/video_feed", web::get().to(video_feed_handler))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/detections", web::get().to(detections_handler))
        .route("/health", web::get().to(health_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Handle for the server thread.
pub(crate) struct StreamServer {
    addrs: Vec<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamServer {
    pub(crate) fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// True once the server thread has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the server thread, returning once the listening socket is bound.
pub(crate) fn spawn_stream_server(
    frames: Arc<PublishedFrameSlot>,
    health: Arc<PipelineHealth>,
    jpeg_quality: u8,
    bind: (IpAddr, u16),
) -> Result<StreamServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) =
        crossbeam_channel::bounded::<std::result::Result<Vec<SocketAddr>, String>>(1);

    let handle = telemetry::spawn_thread("stream-http", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let state = web::Data::new(ServerState {
                frames,
                health,
                jpeg_quality,
            });
            let server = match HttpServer::new(move || {
                App::new().app_data(state.clone()).configure(configure)
            })
            .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
            .bind(bind)
            {
                Ok(server) => server,
                Err(err) => {
                    let _ = bound_tx.send(Err(format!(
                        "failed to bind {}:{}: {err}",
                        bind.0, bind.1
                    )));
                    return Ok(());
                }
            };
            let _ = bound_tx.send(Ok(server.addrs()));
            let server = server.run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;

    let addrs = match bound_rx.recv_timeout(BIND_TIMEOUT) {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(err)) => {
            let _ = handle.join();
            return Err(anyhow!(err));
        }
        Err(err) => {
            let _ = shutdown_tx.send(());
            return Err(anyhow!("HTTP server did not report its bind result: {err}"));
        }
    };

    Ok(StreamServer {
        addrs,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Decrements the client gauge when a stream ends, however it ends.
struct ClientGuard(Arc<PipelineHealth>);

impl ClientGuard {
    fn new(health: Arc<PipelineHealth>) -> Self {
        health.client_connected();
        debug!(clients = health.stream_clients(), "Stream client connected");
        Self(health)
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.client_disconnected();
        debug!(clients = self.0.stream_clients(), "Stream client disconnected");
    }
}

/// JPEG for `frame`, encoding on the blocking pool on first use.
async fn frame_jpeg(frame: Arc<PublishedFrame>, quality: u8) -> Result<Bytes> {
    match web::block(move || frame.jpeg(quality)).await {
        Ok(result) => result,
        Err(err) => Err(anyhow!("JPEG encode task failed: {err}")),
    }
}

/// Stream the annotated feed as `multipart/x-mixed-replace`.
async fn video_feed_handler(state: web::Data<ServerState>) -> HttpResponse {
    let mut updates = state.frames.subscribe();
    let client = ClientGuard::new(state.health.clone());
    let quality = state.jpeg_quality;

    let stream = stream! {
        let _client = client;
        loop {
            let latest = updates.borrow_and_update().clone();
            if let Some(frame) = latest {
                match frame_jpeg(frame, quality).await {
                    Ok(jpeg) => {
                        metrics::counter!("stream_parts_sent_total").increment(1);
                        yield Ok::<Bytes, actix_web::Error>(multipart_part(&jpeg));
                    }
                    Err(err) => warn!("Dropping stream part: {err:#}"),
                }
            }
            // Parks until the detector publishes again; errors only when the
            // pipeline has been torn down.
            if updates.changed().await.is_err() {
                break;
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, STREAM_CONTENT_TYPE))
        .insert_header((header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"))
        .insert_header((header::PRAGMA, "no-cache"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .streaming(stream)
}

/// Return the latest annotated frame as a single JPEG.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    let Some(frame) = state.frames.peek() else {
        return HttpResponse::NoContent().finish();
    };
    match frame_jpeg(frame, state.jpeg_quality).await {
        Ok(jpeg) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .content_type("image/jpeg")
            .body(jpeg),
        Err(err) => HttpResponse::InternalServerError().body(format!("{err:#}")),
    }
}

/// Return the detections of the latest annotated frame as JSON.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.frames.peek() {
        Some(frame) => HttpResponse::Ok().json(DetectionsResponse::from(frame.as_ref())),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn health_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.health.snapshot())
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

/// Log the reachable endpoints once the server is up.
pub(crate) fn log_endpoints(server: &StreamServer) {
    for addr in server.local_addrs() {
        info!("MJPEG stream available at http://{addr}/video_feed");
    }
}

#[cfg(test)]
mod tests {
    use std::{future::poll_fn, pin::Pin};

    use actix_web::{
        body::{BoxBody, MessageBody},
        dev::ServiceResponse,
        test,
    };
    use image::{Rgb, RgbImage};
    use video_ingest::Frame;

    use super::*;
    use crate::vision::{data::DetectionSummary, encoding::encode_jpeg};

    const QUALITY: u8 = 80;

    fn state() -> (Arc<PublishedFrameSlot>, Arc<PipelineHealth>, web::Data<ServerState>) {
        let frames = Arc::new(PublishedFrameSlot::new());
        let health = Arc::new(PipelineHealth::new());
        let data = web::Data::new(ServerState {
            frames: frames.clone(),
            health: health.clone(),
            jpeg_quality: QUALITY,
        });
        (frames, health, data)
    }

    fn annotated(shade: u8) -> PublishedFrame {
        let frame = Frame::from_rgb_image(RgbImage::from_pixel(32, 24, Rgb([shade, 64, 200])), 42);
        PublishedFrame::new(
            frame,
            vec![DetectionSummary {
                class: "person".into(),
                score: 0.75,
                bbox: [1.0, 2.0, 10.0, 20.0],
            }],
            1,
        )
    }

    async fn next_chunk(body: &mut Pin<Box<BoxBody>>, wait: Duration) -> Option<Bytes> {
        let poll = poll_fn(|cx| body.as_mut().poll_next(cx));
        match actix_web::rt::time::timeout(wait, poll).await {
            Ok(Some(Ok(chunk))) => Some(chunk),
            _ => None,
        }
    }

    fn into_body(resp: ServiceResponse) -> Pin<Box<BoxBody>> {
        Box::pin(resp.into_body())
    }

    #[actix_web::test]
    async fn empty_slot_keeps_the_stream_open_without_parts() {
        let (_frames, health, data) = state();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/video_feed").to_request()).await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(health.stream_clients(), 1);

        let mut body = into_body(resp);
        assert!(next_chunk(&mut body, Duration::from_millis(200)).await.is_none());
        drop(body);
        assert_eq!(health.stream_clients(), 0);
    }

    #[actix_web::test]
    async fn two_clients_receive_identical_parts() {
        let (frames, _health, data) = state();
        frames.publish(annotated(10));
        let expected_jpeg = encode_jpeg(&frames.peek().unwrap().frame, QUALITY).unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let first = test::call_service(&app, test::TestRequest::get().uri("/video_feed").to_request()).await;
        let second = test::call_service(&app, test::TestRequest::get().uri("/video_feed").to_request()).await;
        let mut first = into_body(first);
        let mut second = into_body(second);

        let a = next_chunk(&mut first, Duration::from_secs(5)).await.unwrap();
        let b = next_chunk(&mut second, Duration::from_secs(5)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, multipart_part(&expected_jpeg));
        assert!(a.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
    }

    #[actix_web::test]
    async fn publishing_wakes_a_waiting_client() {
        let (frames, _health, data) = state();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/video_feed").to_request()).await;
        let mut body = into_body(resp);
        assert!(next_chunk(&mut body, Duration::from_millis(50)).await.is_none());

        frames.publish(annotated(20));
        let chunk = next_chunk(&mut body, Duration::from_secs(5)).await.unwrap();
        assert!(chunk.starts_with(b"--frame\r\n"));

        // Nothing new published: the client waits instead of repeating.
        assert!(next_chunk(&mut body, Duration::from_millis(100)).await.is_none());
        frames.publish(annotated(30));
        assert!(next_chunk(&mut body, Duration::from_secs(5)).await.is_some());
    }

    #[actix_web::test]
    async fn frame_and_detections_are_empty_before_first_publish() {
        let (frames, _health, data) = state();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/frame.jpg").to_request()).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NO_CONTENT);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/detections").to_request()).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NO_CONTENT);

        frames.publish(annotated(40));
        let resp = test::call_service(&app, test::TestRequest::get().uri("/frame.jpg").to_request()).await;
        assert!(resp.status().is_success());
        let jpeg = test::read_body(resp).await;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let req = test::TestRequest::get().uri("/detections").to_request();
        let json: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(json["frame_number"], 1);
        assert_eq!(json["captured_at_ms"], 42);
        assert_eq!(json["detections"][0]["class"], "person");
    }

    #[actix_web::test]
    async fn health_reports_connection_state() {
        let (_frames, _health, data) = state();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let json: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["connection"], "disconnected");
        assert_eq!(json["stream_clients"], 0);
    }

    #[::core::prelude::v1::test]
    fn server_binds_and_stops() {
        let server = spawn_stream_server(
            Arc::new(PublishedFrameSlot::new()),
            Arc::new(PipelineHealth::new()),
            QUALITY,
            ("127.0.0.1".parse().unwrap(), 0),
        )
        .unwrap();
        assert!(!server.local_addrs().is_empty());
        assert_ne!(server.local_addrs()[0].port(), 0);
        assert!(!server.is_finished());
        server.stop();
    }

    #[::core::prelude::v1::test]
    fn bind_failures_are_reported() {
        let first = spawn_stream_server(
            Arc::new(PublishedFrameSlot::new()),
            Arc::new(PipelineHealth::new()),
            QUALITY,
            ("127.0.0.1".parse().unwrap(), 0),
        )
        .unwrap();
        let taken = first.local_addrs()[0];
        let second = spawn_stream_server(
            Arc::new(PublishedFrameSlot::new()),
            Arc::new(PipelineHealth::new()),
            QUALITY,
            (taken.ip(), taken.port()),
        );
        assert!(second.is_err());
        first.stop();
    }
}
