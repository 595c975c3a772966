//! Shared helpers for host integration tests
#![allow(dead_code)]

use axum::{
    body::Bytes as AxumBytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::{HeaderMap, Method, Uri},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use ceversi_relay::MemoryRelay;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Echo of the request as seen by the backend
async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: AxumBytes) -> String {
    let mut names: Vec<&str> = headers.keys().map(|name| name.as_str()).collect();
    names.sort_unstable();
    let host = headers
        .get("host")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    format!(
        "{} {}\nhost: {}\nheaders: {}\nbody: {}",
        method,
        uri,
        host,
        names.join(","),
        body.len()
    )
}

async fn ws_echo(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_socket)
}

async fn handle_socket(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                let reply = format!("Echo: {}", text.as_str());
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    return;
                }
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

/// Start a stand-in game backend on an ephemeral port
pub async fn start_backend() -> SocketAddr {
    let app = Router::new()
        .route("/api/state", get(|| async { "board" }))
        .route("/ws", get(ws_echo))
        .route("/large", get(|| async { "x".repeat(1024 * 1024) }))
        .fallback(echo);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A port with nothing listening on it
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// GET `path` through a connection dialed on the in-memory relay
pub async fn relay_get(relay: &MemoryRelay, name: &str, path: &str) -> (StatusCode, String) {
    let stream = relay.dial(name).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::get(path)
        .header("host", "ceversi.relay.example.com")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[cfg(unix)]
pub mod scripts {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tempfile::TempDir;

    fn dir() -> &'static TempDir {
        static DIR: OnceLock<TempDir> = OnceLock::new();
        DIR.get_or_init(|| {
            let dir = TempDir::new().unwrap();
            write(dir.path(), "sleeper", "#!/bin/sh\nexec sleep 60\n");
            write(dir.path(), "quitter", "#!/bin/sh\nexit 3\n");
            write(
                dir.path(),
                "pidfile",
                "#!/bin/sh\necho $$ > \"$(dirname \"$0\")/pid.$PORT\"\nexec sleep 60\n",
            );
            dir
        })
    }

    fn write(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Backend that stays up until killed
    pub fn sleeper() -> PathBuf {
        dir().path().join("sleeper")
    }

    /// Backend that exits with status 3 right away
    pub fn quitter() -> PathBuf {
        dir().path().join("quitter")
    }

    /// Backend that records its pid in `pid.$PORT` next to the script, then
    /// stays up until killed
    pub fn pidfile() -> PathBuf {
        dir().path().join("pidfile")
    }

    /// Pid written by [`pidfile`] for a backend on `port`
    pub async fn recorded_pid(port: u16) -> u32 {
        let path = dir().path().join(format!("pid.{}", port));
        for _ in 0..100 {
            if let Ok(pid) = std::fs::read_to_string(&path) {
                if let Ok(pid) = pid.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("backend on port {} never recorded its pid", port);
    }

    /// Whether a process with `pid` still exists
    pub fn is_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Path that does not exist, after the scripts are in place
    pub fn missing() -> PathBuf {
        dir().path().join("missing")
    }
}
