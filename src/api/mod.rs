//! Control surface over plain HTTP/1.1.
//!
//! A thin layer over [`ConnectionManager`] and [`DetectionPipeline`]; each
//! accepted connection is served on its own thread so a long-lived viewer
//! stream or a slow connect never holds up other requests.

use crate::connection::ConnectionManager;
use crate::error::ConnectError;
use crate::pipeline::DetectionPipeline;
use crate::recognize::IdentityStore;
use crate::stream::{StreamEncoder, CONTENT_TYPE as STREAM_CONTENT_TYPE};
use crate::motion::MotionTrigger;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_DETECTION_LIMIT: usize = 20;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub snapshot_quality: u8,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            snapshot_quality: 90,
        }
    }
}

/// Components the endpoints call into.
#[derive(Clone)]
pub struct ApiContext {
    pub manager: Arc<ConnectionManager>,
    pub pipeline: Option<Arc<DetectionPipeline>>,
    pub identities: Option<Arc<dyn IdentityStore>>,
    pub encoder: StreamEncoder,
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
    ctx: ApiContext,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ctx: ApiContext) -> Self {
        Self { cfg, ctx }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let shared = Arc::new((self.cfg, self.ctx));
        let join = std::thread::Builder::new()
            .name("facewatch-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, shared, shutdown_thread) {
                    log::error!("control api stopped: {:#}", err);
                }
            })
            .context("spawn api thread")?;
        log::info!("control api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    shared: Arc<(ApiConfig, ApiContext)>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                let spawned = std::thread::Builder::new()
                    .name("facewatch-api-conn".into())
                    .spawn(move || {
                        let (cfg, ctx) = &*shared;
                        if let Err(err) = handle_connection(stream, cfg, ctx) {
                            log::warn!("api request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("cannot spawn api connection thread: {}", err);
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

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, ctx: &ApiContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json(&mut stream, 400, &json!({"error": "bad_request"}))?;
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.raw_path);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json(&mut stream, 200, &json!({"status": "ok"})),
        ("GET", "/status") => write_json(&mut stream, 200, &ctx.manager.status()),
        ("GET", "/snapshot") => match ctx.manager.snapshot(cfg.snapshot_quality)? {
            Some(jpeg) => write_response(&mut stream, 200, "image/jpeg", &jpeg),
            None => write_json(&mut stream, 404, &json!({"error": "no_frame"})),
        },
        ("GET", "/detections") => {
            let limit = request
                .query("limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DETECTION_LIMIT);
            let detections = ctx.manager.state().recent_detections(limit);
            write_json(&mut stream, 200, &json!({ "detections": detections }))
        }
        ("GET", "/people") => match &ctx.identities {
            Some(store) => {
                let people: Vec<_> = store
                    .known_people()?
                    .into_iter()
                    .map(|(name, samples)| json!({"name": name, "samples": samples}))
                    .collect();
                write_json(&mut stream, 200, &json!({ "people": people }))
            }
            None => write_json(&mut stream, 503, &json!({"error": "no_identity_store"})),
        },
        ("GET", "/stream") => serve_stream(stream, ctx),
        ("POST", "/connect") => handle_connect(&mut stream, &request, ctx),
        ("POST", "/disconnect") => {
            ctx.manager.disconnect();
            write_json(&mut stream, 200, &json!({"status": "disconnected"}))
        }
        ("POST", "/start") => match ctx.manager.start() {
            Ok(()) => write_json(&mut stream, 200, &json!({"status": "started"})),
            Err(err) => write_json(
                &mut stream,
                409,
                &json!({"error": "not_connected", "detail": format!("{:#}", err)}),
            ),
        },
        ("POST", "/stop") => {
            let joined = ctx.manager.stop();
            write_json(&mut stream, 200, &json!({"status": "stopped", "joined": joined}))
        }
        ("POST", "/detection/toggle") => {
            let enabled = ctx.manager.toggle_detection()?;
            log::info!("detection {}", if enabled { "enabled" } else { "disabled" });
            write_json(&mut stream, 200, &json!({ "enabled": enabled }))
        }
        ("POST", "/detect") => handle_manual_detect(&mut stream, ctx),
        (_, "/health" | "/status" | "/snapshot" | "/detections" | "/people" | "/stream")
        | (_, "/connect" | "/disconnect" | "/start" | "/stop" | "/detection/toggle" | "/detect") => {
            write_json(&mut stream, 405, &json!({"error": "method_not_allowed"}))
        }
        _ => write_json(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

fn handle_connect(stream: &mut TcpStream, request: &HttpRequest, ctx: &ApiContext) -> Result<()> {
    let Some(url) = request.source_url() else {
        return write_json(stream, 400, &json!({"error": "missing_url"}));
    };
    let attempts = ctx.manager.policy().connect_attempts;
    match ctx.manager.connect_with_retry(&url, attempts) {
        Ok(()) => {
            let source = ctx.manager.status().snapshot.source;
            write_json(stream, 200, &json!({"status": "connected", "source": source}))
        }
        Err(err @ ConnectError::InvalidDescriptor { .. }) => write_json(
            stream,
            400,
            &json!({"error": "invalid_source", "detail": err.to_string()}),
        ),
        Err(err) => write_json(
            stream,
            502,
            &json!({"error": "connect_failed", "detail": err.to_string()}),
        ),
    }
}

/// Run one detection cycle on the current frame, bypassing the motion gate.
fn handle_manual_detect(stream: &mut TcpStream, ctx: &ApiContext) -> Result<()> {
    let Some(pipeline) = &ctx.pipeline else {
        return write_json(stream, 503, &json!({"error": "detection_unavailable"}));
    };
    let Some(frame) = ctx.manager.state().current_frame() else {
        return write_json(stream, 404, &json!({"error": "no_frame"}));
    };
    let trigger = MotionTrigger {
        sequence: frame.sequence(),
        frame,
        regions: Vec::new(),
    };
    match pipeline.run_cycle(&trigger) {
        Some(event) => write_json(stream, 200, &*event),
        None => write_json(stream, 409, &json!({"error": "recognition_in_flight"})),
    }
}

fn serve_stream(mut stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store, must-revalidate\r\nPragma: no-cache\r\nExpires: 0\r\nConnection: close\r\n\r\n",
        STREAM_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;

    let subscription = ctx.manager.distributor().subscribe();
    let current = ctx.manager.state().current_frame();
    let mut parts = 0u64;
    for part in ctx.encoder.viewer_stream(subscription, current) {
        if let Err(err) = stream.write_all(&part).and_then(|()| stream.flush()) {
            log::debug!("viewer disconnected after {} part(s): {}", parts, err);
            return Ok(());
        }
        parts += 1;
    }
    log::info!("viewer stream ended after {} part(s)", parts);
    Ok(())
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

    let text = String::from_utf8_lossy(&data[..header_end]);
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

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data.get(header_end..).unwrap_or_default().to_vec();
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
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        raw_path: raw_path.to_string(),
        query,
        body,
    })
}

fn write_json<T: Serialize + ?Sized>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
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
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        502 => "HTTP/1.1 502 Bad Gateway",
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
    raw_path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// `?url=` first, then a JSON body with `url` or `rtsp_url`.
    fn source_url(&self) -> Option<String> {
        if let Some(url) = self.query("url").filter(|u| !u.trim().is_empty()) {
            return Some(url.to_string());
        }
        let body: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        ["url", "rtsp_url"]
            .iter()
            .find_map(|key| body.get(key).and_then(|v| v.as_str()))
            .filter(|u| !u.trim().is_empty())
            .map(str::to_string)
    }
}
