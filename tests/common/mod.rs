#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use termrelay::api::{self, AppState};
use termrelay::config::ServerConfig;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Server config rooted in `dir`, running `/bin/sh`, with rate limiting off.
pub fn test_config(dir: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.rate_limit_per_minute = 0;
    config.terminal.shell = "/bin/sh".to_string();
    config.terminal.cwd = dir.to_path_buf();
    config.terminal.kill_grace_secs = 1;
    config
}

/// Start the full router on an ephemeral port. Returns the address and the
/// state shared with the running server.
pub async fn start_server(config: ServerConfig) -> (SocketAddr, AppState) {
    let state = AppState::new(config);
    let app = api::router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        api::serve(listener, app, std::future::pending()).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, state)
}

pub async fn connect(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{}/ws", addr);
    let (ws, _) = connect_async(&url).await.expect("failed to connect");
    ws
}

pub async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("failed to send");
}

/// Receive the next text message and parse it as JSON.
pub async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    let deadline = Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {:?}", other),
        }
    }
}

/// Receive messages until one of type `kind` arrives.
pub async fn recv_type(ws: &mut WsStream, kind: &str) -> serde_json::Value {
    loop {
        let v = recv_json(ws).await;
        if v["type"] == kind {
            return v;
        }
    }
}

/// Try to receive a JSON message within `timeout`.
pub async fn try_recv_json(ws: &mut WsStream, timeout: Duration) -> Option<serde_json::Value> {
    match tokio::time::timeout(timeout, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(serde_json::from_str(&text).unwrap()),
        _ => None,
    }
}

/// Start a session on `ws` and assert it was accepted.
pub async fn start_session(ws: &mut WsStream, id: &str) {
    send_json(ws, serde_json::json!({"type": "start_session", "sessionId": id})).await;
    let reply = recv_type(ws, "session_started").await;
    assert_eq!(reply["sessionId"], id);
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
