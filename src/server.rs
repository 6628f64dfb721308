//! HTTP control surface: commands, knobs, preview and status

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use image::{ImageOutputFormat, RgbImage};
use parking_lot::RwLock;
use serde::Serialize;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::command;
use crate::knobs::{Knobs, KnobsUpdate, RuntimeKnobs};
use crate::undistort::FrameSize;

const PREVIEW_QUALITY: u8 = 70;

/// State shared between the capture thread and the HTTP handlers
pub struct AppState {
    /// Module name, for status output
    pub name: String,
    pub knobs: Arc<RuntimeKnobs>,
    /// Set by the `quit` command; stops the capture loop
    pub quit: AtomicBool,
    projection: Option<&'static str>,
    /// Latest corrected frame (JPEG encoded)
    preview_frame: RwLock<Vec<u8>>,
    frames_processed: AtomicU64,
    last_size: RwLock<Option<FrameSize>>,
}

impl AppState {
    pub fn new(name: String, knobs: Arc<RuntimeKnobs>, projection: Option<&'static str>) -> Self {
        Self {
            name,
            knobs,
            quit: AtomicBool::new(false),
            projection,
            preview_frame: RwLock::new(Vec::new()),
            frames_processed: AtomicU64::new(0),
            last_size: RwLock::new(None),
        }
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Record a processed frame and the input size it arrived with
    pub fn record_frame(&self, input: FrameSize) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        *self.last_size.write() = Some(input);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    /// Update the preview frame (called from the capture thread)
    pub fn update_preview(&self, frame: &RgbImage) {
        match encode_jpeg(frame, PREVIEW_QUALITY) {
            Ok(jpeg) => *self.preview_frame.write() = jpeg,
            Err(e) => tracing::debug!("Preview encode failed: {}", e),
        }
    }

    pub fn get_preview(&self) -> Vec<u8> {
        self.preview_frame.read().clone()
    }
}

/// Encode an RGB frame to JPEG
fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg_data = Vec::new();
    frame.write_to(&mut Cursor::new(&mut jpeg_data), ImageOutputFormat::Jpeg(quality))?;
    Ok(jpeg_data)
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/command", post(post_command))
        .route("/api/knobs", get(get_knobs).post(set_knobs))
        .route("/api/preview", get(get_preview))
        .route("/api/preview/stream", get(preview_stream))
        .route("/api/info", get(get_info))
        .layer(cors)
        .with_state(state)
}

/// Run the control server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Control server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Execute one text command, e.g. `sat 0.5`
async fn post_command(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    match command::handle_line(body.trim(), &state.knobs, &state.quit) {
        Ok(reply) => (StatusCode::OK, reply.to_string()),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn get_knobs(State(state): State<Arc<AppState>>) -> Json<Knobs> {
    Json(state.knobs.snapshot())
}

/// Partially update the knobs; absent fields keep their value
async fn set_knobs(
    State(state): State<Arc<AppState>>,
    Json(update): Json<KnobsUpdate>,
) -> Result<Json<Knobs>, (StatusCode, String)> {
    match state.knobs.apply(&update) {
        Ok(knobs) => {
            tracing::info!("Knobs updated: {:?}", knobs);
            Ok(Json(knobs))
        }
        Err(e) => {
            tracing::warn!("Knobs update rejected: {}", e);
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
    }
}

/// Latest corrected frame (JPEG)
async fn get_preview(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let frame = state.get_preview();
    if frame.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response();
    }

    ([(axum::http::header::CONTENT_TYPE, "image/jpeg")], frame).into_response()
}

/// MJPEG stream of the corrected output
async fn preview_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_millis(100),
    ))
    .filter_map(move |_| multipart_part(&state.get_preview()))
    .map(Ok::<_, std::convert::Infallible>);

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        Body::from_stream(stream),
    )
}

/// One part of the multipart stream; `None` until a frame exists
fn multipart_part(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.is_empty() {
        return None;
    }

    let mut part = Vec::with_capacity(frame.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    part.extend_from_slice(frame.len().to_string().as_bytes());
    part.extend_from_slice(b"\r\n\r\n");
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    Some(part)
}

#[derive(Serialize)]
struct InfoResponse {
    version: String,
    name: String,
    /// `null` when frames pass through uncorrected
    projection: Option<&'static str>,
    frames_processed: u64,
    last_size: Option<FrameSize>,
}

async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        name: state.name.clone(),
        projection: state.projection,
        frames_processed: state.frames_processed(),
        last_size: *state.last_size.read(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use image::Rgb;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let knobs = Arc::new(RuntimeKnobs::default());
        Arc::new(AppState::new("/camCalib".into(), knobs, Some("pinhole")))
    }

    async fn send(state: Arc<AppState>, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    fn command_request(line: &str) -> Request<Body> {
        Request::post("/api/command").body(Body::from(line.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_command_sets_saturation() {
        let state = state();
        let (status, body) = send(state.clone(), command_request("sat 0.5\n")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
        assert_eq!(state.knobs.snapshot().saturation, 0.5);
    }

    #[tokio::test]
    async fn test_command_unknown_and_invalid() {
        let state = state();
        let (status, body) = send(state.clone(), command_request("focus 3")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, command::REPLY_UNKNOWN.as_bytes());

        let (status, _) = send(state.clone(), command_request("saturation lots")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.knobs.snapshot().saturation, 1.0);
    }

    #[tokio::test]
    async fn test_quit_command() {
        let state = state();
        let (_, body) = send(state.clone(), command_request("quit")).await;
        assert_eq!(body, b"quitting");
        assert!(state.quit_requested());
    }

    #[tokio::test]
    async fn test_knobs_partial_update() {
        let state = state();
        let request = Request::post("/api/knobs")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"output_width": 320, "output_height": 240}"#))
            .unwrap();
        let (status, body) = send(state.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        let knobs: Knobs = serde_json::from_slice(&body).unwrap();
        assert_eq!(knobs.output_size(), Some(FrameSize::new(320, 240)));
        assert_eq!(knobs.saturation, 1.0);

        let (_, body) = send(state, get_request("/api/knobs")).await;
        let knobs: Knobs = serde_json::from_slice(&body).unwrap();
        assert_eq!(knobs.output_width, 320);
    }

    #[tokio::test]
    async fn test_knobs_out_of_range_rejected() {
        let state = state();
        let request = Request::post("/api/knobs")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"output_width":4294967295,"output_height":4294967295}"#))
            .unwrap();
        let (status, body) = send(state.clone(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("output_width"));
        assert_eq!(state.knobs.snapshot().output_size(), None);
    }

    #[tokio::test]
    async fn test_preview_unavailable_then_jpeg() {
        let state = state();
        let (status, _) = send(state.clone(), get_request("/api/preview")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.update_preview(&RgbImage::from_pixel(16, 8, Rgb([10, 20, 30])));
        let (status, body) = send(state, get_request("/api/preview")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_info_reports_frames() {
        let state = state();
        state.record_frame(FrameSize::new(640, 480));
        state.record_frame(FrameSize::new(640, 480));
        let (_, body) = send(state, get_request("/api/info")).await;
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["name"], "/camCalib");
        assert_eq!(info["projection"], "pinhole");
        assert_eq!(info["frames_processed"], 2);
        assert_eq!(info["last_size"]["width"], 640);
    }

    #[test]
    fn test_multipart_part() {
        assert_eq!(multipart_part(&[]), None);
        let part = multipart_part(&[1, 2, 3]).unwrap();
        assert!(part.starts_with(b"--frame\r\n"));
        assert!(part.ends_with(&[1, 2, 3, b'\r', b'\n']));
        assert!(String::from_utf8_lossy(&part).contains("Content-Length: 3"));
    }
}
