use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::process::run_once;
use crate::protocol::iso_timestamp;
use crate::session::SessionSummary;
use crate::validator::CommandValidator;

use super::connection::run_socket;
use super::error::ApiError;
use super::AppState;

/// Upper bound on a one-shot `execute` request.
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct HealthResponse {
    status: &'static str,
    timestamp: String,
    uptime: f64,
    active_sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: iso_timestamp(chrono::Utc::now()),
        uptime: state.started_at.elapsed().as_secs_f64(),
        active_sessions: state.registry.count(),
    })
}

#[derive(Serialize)]
pub(super) struct SessionListResponse {
    sessions: Vec<SessionSummary>,
    count: usize,
}

pub(super) async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    let sessions = state.registry.list();
    Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SystemInfoResponse {
    platform: &'static str,
    arch: &'static str,
    hostname: String,
    cwd: String,
    default_shell: String,
    max_sessions: usize,
    active_sessions: usize,
    version: &'static str,
}

pub(super) async fn system_info(State(state): State<AppState>) -> Json<SystemInfoResponse> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let terminal = &state.config.terminal;
    Json(SystemInfoResponse {
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        hostname,
        cwd: terminal.cwd.display().to_string(),
        default_shell: terminal.shell.clone(),
        max_sessions: state.registry.max_sessions(),
        active_sessions: state.registry.count(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Deserialize)]
pub(super) struct ExecuteRequest {
    #[serde(default)]
    command: serde_json::Value,
    cwd: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ExecuteResponse {
    success: bool,
    stdout: String,
    stderr: String,
    error: Option<String>,
    timestamp: String,
}

/// Run one command outside any session and return its captured output.
pub(super) async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Json(req) = payload?;
    let missing = match &req.command {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Bool(b) => !b,
        serde_json::Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    };
    if missing {
        return Err(ApiError::CommandRequired);
    }
    let command = CommandValidator::new().validate_value(&req.command)?;

    let cwd = req
        .cwd
        .filter(|c| !c.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| state.config.terminal.cwd.clone());

    tracing::debug!(%command, cwd = %cwd.display(), "one-shot execute");
    let output = run_once(&command, &cwd, EXECUTE_TIMEOUT).await;
    Ok(Json(ExecuteResponse {
        success: output.success,
        stdout: output.stdout,
        stderr: output.stderr,
        error: output.error,
        timestamp: iso_timestamp(chrono::Utc::now()),
    }))
}

pub(super) async fn ws_terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_socket(socket, state, client))
}
