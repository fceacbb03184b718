#![allow(dead_code)]

//! Test harness: a scripted mock Docker engine served over a real unix
//! socket, a proxy instance wired to it, and a raw HTTP client. The mock
//! keeps per-resource owner state so ownership scenarios can be expressed
//! as plain data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use sockguard::config::Config;
use sockguard::director::{Director, routes};
use sockguard::http::{ResponseHead, read_body, read_request_head, read_response_head};
use sockguard::proxy::SocketProxy;
use sockguard::upstream::UpstreamClient;

pub const OWNER: &str = "test-owner";

/// A request as the mock engine saw it.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json_body(&self) -> Value {
        serde_json::from_slice(&self.body).expect("recorded body is JSON")
    }
}

/// Mutable world state of the mock engine. Resource maps go from id/name to
/// owner; an empty owner string means the resource has no owner label.
#[derive(Default)]
pub struct EngineState {
    pub containers: HashMap<String, String>,
    pub images: HashMap<String, String>,
    pub networks: HashMap<String, String>,
    pub volumes: HashMap<String, String>,
    /// (network, container, alias) per connect call.
    pub connected: Vec<(String, String, Option<String>)>,
    /// (network, container) per disconnect call.
    pub disconnected: Vec<(String, String)>,
    pub requests: Vec<RecordedRequest>,
    /// When set, connect calls answer 500.
    pub fail_connect: bool,
}

impl EngineState {
    pub fn with_container(mut self, id: &str, owner: &str) -> Self {
        self.containers.insert(id.into(), owner.into());
        self
    }

    pub fn with_image(mut self, id: &str, owner: &str) -> Self {
        self.images.insert(id.into(), owner.into());
        self
    }

    pub fn with_network(mut self, id: &str, owner: &str) -> Self {
        self.networks.insert(id.into(), owner.into());
        self
    }

    pub fn with_volume(mut self, name: &str, owner: &str) -> Self {
        self.volumes.insert(name.into(), owner.into());
        self
    }
}

pub struct MockEngine {
    pub socket: PathBuf,
    pub state: Arc<Mutex<EngineState>>,
    _dir: TempDir,
}

impl MockEngine {
    pub fn spawn(state: EngineState) -> Self {
        let dir = TempDir::new().expect("engine socket dir");
        let socket = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&socket).expect("bind engine socket");
        let state = Arc::new(Mutex::new(state));

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve_engine_connection(stream, state).await;
                });
            }
        });

        Self {
            socket,
            state,
            _dir: dir,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

async fn serve_engine_connection(
    mut stream: UnixStream,
    state: Arc<Mutex<EngineState>>,
) -> std::io::Result<()> {
    let mut spill = Vec::new();
    let head = match read_request_head(&mut stream, &mut spill).await {
        Ok(Some(head)) => head,
        _ => return Ok(()),
    };
    let mode = head.body_mode().expect("engine request framing");
    let body = read_body(&mut stream, &mut spill, mode)
        .await
        .expect("engine request body");

    let method = head.method.clone();
    let path = routes::strip_version(&head.path).to_string();
    {
        let mut state = state.lock().unwrap();
        state.requests.push(RecordedRequest {
            method: head.method.clone(),
            target: head.target(),
            headers: head
                .headers
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect(),
            body: body.clone(),
        });
    }

    let (status, payload) = respond(&method, &path, &body, &state);
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Error",
    };
    let message = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    stream.write_all(message.as_bytes()).await?;
    stream.write_all(payload.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

fn labels_json(owner: &str) -> Value {
    if owner.is_empty() {
        json!({})
    } else {
        json!({ "com.buildkite.sockguard.owner": owner })
    }
}

fn respond(
    method: &str,
    path: &str,
    body: &[u8],
    state: &Arc<Mutex<EngineState>>,
) -> (u16, String) {
    let mut state = state.lock().unwrap();
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        ("GET", ["containers", id, "json"]) => match state.containers.get(*id) {
            Some(owner) => (
                200,
                json!({ "Id": id, "Config": { "Labels": labels_json(owner) } }).to_string(),
            ),
            None => (404, json!({ "message": format!("No such container: {id}") }).to_string()),
        },
        ("GET", ["images", id, "json"]) => match state.images.get(*id) {
            Some(owner) => (
                200,
                json!({ "Id": id, "Config": { "Labels": labels_json(owner) } }).to_string(),
            ),
            None => (404, json!({ "message": format!("no such image: {id}") }).to_string()),
        },
        ("GET", ["networks", id]) => match state.networks.get(*id) {
            Some(owner) => (
                200,
                json!({ "Id": id, "Labels": labels_json(owner) }).to_string(),
            ),
            None => (404, json!({ "message": format!("network {id} not found") }).to_string()),
        },
        ("GET", ["volumes", name]) => match state.volumes.get(*name) {
            Some(owner) => (
                200,
                json!({ "Name": name, "Labels": labels_json(owner) }).to_string(),
            ),
            None => (404, json!({ "message": format!("get {name}: no such volume") }).to_string()),
        },
        ("POST", ["networks", id, "connect"]) => {
            if state.fail_connect {
                return (500, json!({ "message": "connect refused by test" }).to_string());
            }
            if !state.networks.contains_key(*id) {
                return (404, json!({ "message": format!("network {id} not found") }).to_string());
            }
            let doc: Value = serde_json::from_slice(body).expect("connect body");
            let container = doc["Container"].as_str().expect("Container").to_string();
            let alias = doc["EndpointConfig"]["Aliases"][0]
                .as_str()
                .map(str::to_string);
            state.connected.push((id.to_string(), container, alias));
            (200, "{}".to_string())
        }
        ("POST", ["networks", id, "disconnect"]) => {
            if !state.networks.contains_key(*id) {
                return (404, json!({ "message": format!("network {id} not found") }).to_string());
            }
            let doc: Value = serde_json::from_slice(body).expect("disconnect body");
            let container = doc["Container"].as_str().expect("Container").to_string();
            state.disconnected.push((id.to_string(), container));
            (200, "{}".to_string())
        }
        ("DELETE", ["networks", id]) => {
            if state.networks.remove(*id).is_none() {
                return (404, json!({ "message": format!("network {id} not found") }).to_string());
            }
            (200, "{}".to_string())
        }
        ("POST", ["networks", "create"]) => {
            let doc: Value = serde_json::from_slice(body).expect("network create body");
            let name = doc["Name"].as_str().expect("Name").to_string();
            let owner = doc["Labels"][sockguard::constants::OWNER_LABEL_KEY]
                .as_str()
                .unwrap_or_default()
                .to_string();
            state.networks.insert(name.clone(), owner);
            (200, json!({ "Id": name }).to_string())
        }
        ("GET", ["_ping"]) => (200, "OK".to_string()),
        _ => (200, "{}".to_string()),
    }
}

pub struct TestProxy {
    pub socket: PathBuf,
    _dir: TempDir,
}

/// Start a proxy instance against the given engine socket.
pub fn spawn_proxy(config: Config, engine_socket: &Path) -> TestProxy {
    let dir = TempDir::new().expect("proxy socket dir");
    let socket = dir.path().join("sockguard.sock");
    let listener = UnixListener::bind(&socket).expect("bind proxy socket");

    let director = Director::new(config, UpstreamClient::new(engine_socket));
    let proxy = Arc::new(SocketProxy::new(director));
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });

    TestProxy {
        socket,
        _dir: dir,
    }
}

/// One complete scripted exchange: write raw bytes, half-close, read to EOF.
pub async fn roundtrip(socket: &Path, raw: &[u8]) -> (ResponseHead, Vec<u8>) {
    let mut stream = UnixStream::connect(socket).await.expect("connect proxy");
    stream.write_all(raw).await.expect("write request");
    stream.flush().await.expect("flush request");
    // Half-close: the request is complete, the response may still stream.
    stream.shutdown().await.expect("half-close request side");

    let mut raw_response = Vec::new();
    stream
        .read_to_end(&mut raw_response)
        .await
        .expect("read response");

    let mut reader: &[u8] = &raw_response;
    let mut spill = Vec::new();
    let head = read_response_head(&mut reader, &mut spill)
        .await
        .expect("parse response head");
    let mode = head.body_mode().expect("response framing");
    let body = read_body(&mut reader, &mut spill, mode)
        .await
        .expect("response body");
    (head, body)
}

pub async fn get(socket: &Path, target: &str) -> (ResponseHead, Vec<u8>) {
    let raw = format!("GET {target} HTTP/1.1\r\nHost: docker\r\n\r\n");
    roundtrip(socket, raw.as_bytes()).await
}

pub async fn delete(socket: &Path, target: &str) -> (ResponseHead, Vec<u8>) {
    let raw = format!("DELETE {target} HTTP/1.1\r\nHost: docker\r\n\r\n");
    roundtrip(socket, raw.as_bytes()).await
}

pub async fn post_json(socket: &Path, target: &str, body: &str) -> (ResponseHead, Vec<u8>) {
    let raw = format!(
        "POST {target} HTTP/1.1\r\nHost: docker\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    roundtrip(socket, raw.as_bytes()).await
}

/// Wait for asynchronous follow-up work (the sibling attach runs after the
/// response has been relayed).
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within a second");
}

pub fn config() -> Config {
    Config::with_owner(OWNER)
}
