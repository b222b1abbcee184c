//! Status and preview HTTP surface.
//!
//! Plain `TcpListener` server, one thread per connection so the MJPEG preview can
//! hold its socket open. Handlers only translate between HTTP and the service,
//! camera registry and capture objects.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;

use crate::cameras::CameraRegistry;
use crate::capture::TrainingCapture;
use crate::pipeline::{SettingsPatch, TrackOverlay};
use crate::runtime::DetectionService;
use crate::tracker::TrackState;
use crate::verification::Classification;

const MAX_REQUEST_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 16 * 1024;
const DEFAULT_DETECTION_LIMIT: usize = 50;
const STREAM_BOUNDARY: &str = "frame";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Upper bound on preview frames per second per client.
    pub preview_fps: u32,
    pub capture_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            preview_fps: 15,
            capture_interval: Duration::from_millis(100),
        }
    }
}

/// Objects the handlers talk to.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<DetectionService>,
    pub cameras: Arc<CameraRegistry>,
    pub capture: Option<Arc<TrainingCapture>>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, self.cfg, self.state, shutdown_thread) {
                    log::error!("ApiServer: stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    state: ApiState,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let cfg = cfg.clone();
                let state = state.clone();
                let shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &cfg, &state, &shutdown) {
                            log::warn!("ApiServer: request failed: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("ApiServer: cannot spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    state: &ApiState,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_error(&mut stream, 403, "forbidden")?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/api/status") => write_json(&mut stream, 200, &state.service.status()),
        ("GET", "/api/tracks") => write_json(&mut stream, 200, &*state.service.overlays()),
        ("GET", "/api/cameras") => {
            let current = state.cameras.current().map(|c| c.id);
            write_json(
                &mut stream,
                200,
                &serde_json::json!({
                    "cameras": state.cameras.list(),
                    "current": current,
                }),
            )
        }
        ("GET", "/api/detections") => detections(&mut stream, state, &request),
        ("GET", "/api/settings") => match state.service.pipeline().lock() {
            Ok(pipeline) => write_json(&mut stream, 200, &pipeline.settings()),
            Err(_) => write_error(&mut stream, 500, "pipeline_unavailable"),
        },
        ("POST", "/api/settings") => settings(&mut stream, state, &request),
        ("GET", "/api/stream") => preview(&mut stream, cfg, state, shutdown),
        ("POST", "/api/start") => {
            let started = state.service.start()?;
            write_json(&mut stream, 200, &serde_json::json!({ "started": started }))
        }
        ("POST", "/api/stop") => {
            let stopped = state.service.stop()?;
            write_json(&mut stream, 200, &serde_json::json!({ "stopped": stopped }))
        }
        ("POST", "/api/camera/select") => {
            let Some(id) = request.query("id") else {
                return write_error(&mut stream, 400, "missing_id");
            };
            if state.cameras.get(&id).is_none() {
                return write_error(&mut stream, 404, "unknown_camera");
            }
            match state.cameras.select(&id) {
                Ok(_) => write_json(&mut stream, 200, &serde_json::json!({ "current": id })),
                Err(err) => {
                    log::warn!("ApiServer: camera switch to {} failed: {:#}", id, err);
                    write_error(&mut stream, 503, "camera_unavailable")
                }
            }
        }
        ("GET", "/api/capture/status") => match &state.capture {
            Some(capture) => write_json(&mut stream, 200, &capture.status()),
            None => write_error(&mut stream, 404, "capture_disabled"),
        },
        ("POST", "/api/capture/start") => capture_start(&mut stream, cfg, state, &request),
        ("POST", "/api/capture/stop") => match &state.capture {
            Some(capture) => match capture.stop() {
                Ok(total) => write_json(&mut stream, 200, &serde_json::json!({ "total_captured": total })),
                Err(_) => write_error(&mut stream, 409, "not_capturing"),
            },
            None => write_error(&mut stream, 404, "capture_disabled"),
        },
        (_, "/health")
        | (_, "/api/status")
        | (_, "/api/tracks")
        | (_, "/api/cameras")
        | (_, "/api/detections")
        | (_, "/api/settings")
        | (_, "/api/stream")
        | (_, "/api/start")
        | (_, "/api/stop")
        | (_, "/api/camera/select")
        | (_, "/api/capture/status")
        | (_, "/api/capture/start")
        | (_, "/api/capture/stop") => write_error(&mut stream, 405, "method_not_allowed"),
        _ => write_error(&mut stream, 404, "not_found"),
    }
}

fn detections(stream: &mut TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let limit = match request.query("limit") {
        Some(raw) => match raw.parse::<usize>() {
            Ok(limit) => limit,
            Err(_) => return write_error(stream, 400, "invalid_limit"),
        },
        None => DEFAULT_DETECTION_LIMIT,
    };
    let filter = match request.query("type").as_deref() {
        None | Some("all") => None,
        Some("known") => Some(Classification::Known),
        Some("unknown") => Some(Classification::Unknown),
        Some(_) => return write_error(stream, 400, "invalid_type"),
    };
    let records = {
        let pipeline = state
            .service
            .pipeline()
            .lock()
            .map_err(|_| anyhow!("pipeline lock poisoned"))?;
        let store = pipeline
            .store()
            .lock()
            .map_err(|_| anyhow!("evidence store lock poisoned"))?;
        store.records(limit, filter)
    };
    write_json(stream, 200, &records)
}

fn settings(stream: &mut TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let patch: SettingsPatch = match serde_json::from_slice(&request.body) {
        Ok(patch) => patch,
        Err(_) => return write_error(stream, 400, "invalid_json"),
    };
    let applied = state
        .service
        .pipeline()
        .lock()
        .map_err(|_| anyhow!("pipeline lock poisoned"))?
        .apply(&patch);
    match applied {
        Ok(settings) => write_json(stream, 200, &settings),
        Err(err) => write_json(
            stream,
            400,
            &serde_json::json!({ "error": "invalid_settings", "detail": err.to_string() }),
        ),
    }
}

fn capture_start(
    stream: &mut TcpStream,
    cfg: &ApiConfig,
    state: &ApiState,
    request: &HttpRequest,
) -> Result<()> {
    let Some(capture) = &state.capture else {
        return write_error(stream, 404, "capture_disabled");
    };
    let Some(person) = request.query("person") else {
        return write_error(stream, 400, "missing_person");
    };
    let target = match request.query("target").map(|t| t.parse::<u32>()) {
        None => 300,
        Some(Ok(target)) => target,
        Some(Err(_)) => return write_error(stream, 400, "invalid_target"),
    };
    let Some(camera) = state.cameras.current() else {
        return write_error(stream, 409, "no_camera");
    };
    let dataset = match capture.start(&person, &camera.id, target) {
        Ok(dataset) => dataset,
        Err(err) => {
            return write_json(
                stream,
                409,
                &serde_json::json!({ "error": "capture_refused", "detail": err.to_string() }),
            )
        }
    };
    if let Err(err) = capture.spawn_auto(state.service.multiplexer(), cfg.capture_interval) {
        let _ = capture.stop();
        return Err(err);
    }
    write_json(
        stream,
        200,
        &serde_json::json!({ "status": "started", "dataset": dataset, "target": target }),
    )
}

/// MJPEG preview: pushes the latest frame with track overlays until the client leaves.
fn preview(
    stream: &mut TcpStream,
    cfg: &ApiConfig,
    state: &ApiState,
    shutdown: &AtomicBool,
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        STREAM_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    let interval = Duration::from_millis(1000 / u64::from(cfg.preview_fps.max(1)));
    let mux = state.service.multiplexer();
    let mut last_index = None;
    while !shutdown.load(Ordering::SeqCst) {
        if let Ok(frame) = mux.read_latest() {
            if last_index.map_or(true, |last| frame.index > last) {
                last_index = Some(frame.index);
                let mut image = frame.to_rgb_image()?;
                draw_overlays(&mut image, &state.service.overlays());
                let jpeg = encode_jpeg(&image)?;
                let part = format!(
                    "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    STREAM_BOUNDARY,
                    jpeg.len()
                );
                let sent = stream
                    .write_all(part.as_bytes())
                    .and_then(|_| stream.write_all(&jpeg))
                    .and_then(|_| stream.write_all(b"\r\n"));
                if sent.is_err() {
                    log::debug!("ApiServer: preview client disconnected");
                    break;
                }
            }
        }
        std::thread::sleep(interval);
    }
    Ok(())
}

fn overlay_color(state: TrackState) -> Rgb<u8> {
    match state {
        TrackState::Pending => Rgb([255, 200, 0]),
        TrackState::Known => Rgb([0, 255, 0]),
        TrackState::Unknown => Rgb([255, 0, 0]),
    }
}

fn draw_overlays(image: &mut RgbImage, overlays: &[TrackOverlay]) {
    for overlay in overlays {
        let Some((x0, y0, x1, y1)) = overlay.bbox.clamped_corners(image.width(), image.height())
        else {
            continue;
        };
        let rect = Rect::at(x0 as i32, y0 as i32).of_size(x1 - x0, y1 - y0);
        draw_hollow_rect_mut(image, rect, overlay_color(overlay.state));
    }
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end.min(data.len())..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        body,
    })
}

fn write_json<T: Serialize + ?Sized>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_error(stream: &mut TcpStream, status: u16, error: &str) -> Result<()> {
    write_json(stream, status, &serde_json::json!({ "error": error }))
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}
