use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use facewatch::api::{ApiConfig, ApiContext, ApiHandle, ApiServer};
use facewatch::{
    ConnectionManager, FrameDistributor, InMemoryIdentityStore, NetworkConnector, RetryPolicy,
    SharedState, SourceOptions, StreamConfig, StreamEncoder,
};

fn spawn_api(with_store: bool) -> (ApiHandle, Arc<ConnectionManager>) {
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(NetworkConnector),
        SourceOptions {
            width: 64,
            height: 48,
            ..SourceOptions::default()
        },
        RetryPolicy {
            connect_attempts: 1,
            join_timeout: Duration::from_secs(2),
            ..RetryPolicy::default()
        },
        SharedState::new(5),
        FrameDistributor::new(3),
    ));
    let identities = if with_store {
        let store = InMemoryIdentityStore::new(2);
        store.enroll("alice", vec![1.0, 0.0]).expect("enroll");
        store.enroll("alice", vec![0.9, 0.1]).expect("enroll");
        Some(Arc::new(store) as Arc<dyn facewatch::IdentityStore>)
    } else {
        None
    };
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        },
        ApiContext {
            manager: manager.clone(),
            pipeline: None,
            identities,
            encoder: StreamEncoder::new(StreamConfig {
                poll_timeout: Duration::from_millis(50),
                max_empty_polls: 2,
                ..StreamConfig::default()
            }),
        },
    )
    .spawn()
    .expect("spawn api");
    (handle, manager)
}

/// Send one request and read until the server closes the connection.
fn send(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("connect api");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).expect("write request");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    (status, head, raw[split + 4..].to_vec())
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).expect("json body")
}

#[test]
fn health_status_and_routing() {
    let (handle, _manager) = spawn_api(false);
    let addr = handle.addr;

    let (status, _, body) = send(addr, "GET", "/health", "");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["status"], "ok");

    let (status, _, body) = send(addr, "GET", "/status", "");
    assert_eq!(status, 200);
    let body = json(&body);
    assert_eq!(body["state"], "disconnected");
    assert_eq!(body["capture_running"], false);

    assert_eq!(send(addr, "GET", "/nope", "").0, 404);
    assert_eq!(send(addr, "DELETE", "/status", "").0, 405);
    assert_eq!(send(addr, "GET", "/snapshot", "").0, 404);
    assert_eq!(send(addr, "POST", "/start", "").0, 409);
    assert_eq!(send(addr, "GET", "/people", "").0, 503);
    assert_eq!(send(addr, "POST", "/detect", "").0, 503);

    handle.stop().expect("stop api");
}

#[test]
fn connect_rejects_bad_descriptors() {
    let (handle, manager) = spawn_api(false);
    let addr = handle.addr;

    let (status, _, body) = send(addr, "POST", "/connect?url=ftp://camera", "");
    assert_eq!(status, 400);
    assert_eq!(json(&body)["error"], "invalid_source");

    let (status, _, body) = send(addr, "POST", "/connect", "");
    assert_eq!(status, 400);
    assert_eq!(json(&body)["error"], "missing_url");

    assert!(!manager.is_connected());
    handle.stop().expect("stop api");
}

#[test]
fn stub_source_lifecycle_over_http() {
    let (handle, manager) = spawn_api(true);
    let addr = handle.addr;

    let (status, _, body) = send(addr, "POST", "/connect", r#"{"url":"stub://lobby"}"#);
    assert_eq!(status, 200, "{}", String::from_utf8_lossy(&body));
    assert_eq!(json(&body)["status"], "connected");

    let (status, head, jpeg) = send(addr, "GET", "/snapshot", "");
    assert_eq!(status, 200);
    assert!(head.contains("Content-Type: image/jpeg"));
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let (status, _, body) = send(addr, "GET", "/people", "");
    assert_eq!(status, 200);
    let people = json(&body);
    assert_eq!(people["people"][0]["name"], "alice");
    assert_eq!(people["people"][0]["samples"], 2);

    let (status, _, body) = send(addr, "POST", "/detection/toggle", "");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["enabled"], false);

    let (status, head, stream) = send(addr, "GET", "/stream", "");
    assert_eq!(status, 200);
    assert!(head.contains("multipart/x-mixed-replace; boundary=frame"));
    let text = String::from_utf8_lossy(&stream);
    assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
    assert!(text.matches("--frame\r\n").count() >= 2);

    assert_eq!(send(addr, "POST", "/start", "").0, 200);
    assert!(manager.is_running());
    let (status, _, body) = send(addr, "POST", "/stop", "");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["joined"], true);

    assert_eq!(send(addr, "POST", "/disconnect", "").0, 200);
    assert!(!manager.is_connected());
    handle.stop().expect("stop api");
}
