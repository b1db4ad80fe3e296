// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dashboard gateway (C11): a thin HTTP+WebSocket surface over the router,
//! registry, store, and spawner, generalized from the teacher's
//! `transport::build_router` (`crates/cli/src/transport/mod.rs`) — the same
//! layering of a CORS layer, an auth middleware gating everything but
//! `/health` and the WebSocket upgrades, and handlers that return the
//! shared `ErrorResponse`/`ErrorBody` envelope (`transport::auth`,
//! `transport::http::upload`).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use relay_proto::{ErrorBody, ErrorCode, Message, MessageKind, MessageMeta};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::registry::{AgentRecord, ConnState, Registry};
use crate::router::Router as RelayRouter;
use crate::sessions::SessionTracker;
use crate::spawner::{Spawner, WorkerInfo};
use crate::store::{AgentSummary, MessageFilter, Session, Store};
use crate::time::now_ms;

/// Maximum accepted WebSocket frame, per spec.md §4.11.
const MAX_WS_FRAME_BYTES: usize = 100 * 1024 * 1024;
const LOG_PING_INTERVAL: Duration = Duration::from_secs(30);
const DASHBOARD_TICK_INTERVAL: Duration = Duration::from_secs(1);
const PRESENCE_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Non-standard close code the spec assigns to "no such agent" (spec.md §6).
const CLOSE_UNKNOWN_AGENT: u16 = 4404;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

fn error_response(code: ErrorCode, message: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse { error: code.body(message) })).into_response()
}

pub struct GatewayState {
    pub store: Store,
    pub registry: Arc<Registry>,
    pub router: Arc<RelayRouter>,
    pub sessions: Arc<SessionTracker>,
    pub spawner: Arc<Spawner>,
    pub auth_token: Option<String>,
    pub attachments_dir: PathBuf,
}

/// Build the axum `Router` with the full route table from spec.md §6.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/send", post(send_message))
        .route("/api/upload", post(upload_attachment))
        .route("/api/data", get(dashboard_data))
        .route("/api/history/messages", get(history_messages))
        .route("/api/history/sessions", get(history_sessions))
        .route("/api/history/conversations", get(history_conversations))
        .route("/api/spawn", post(spawn_agent))
        .route("/api/spawned", get(list_spawned))
        .route("/api/spawned/{name}", delete(release_spawned))
        .route("/api/logs/{name}", get(agent_logs))
        .route("/ws", get(ws_dashboard))
        .route("/ws/bridge", get(ws_bridge))
        .route("/ws/logs/{name}", get(ws_logs))
        .route("/ws/presence", get(ws_presence))
        .layer(middleware::from_fn_with_state(state.clone(), auth_layer))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Bearer-token auth, skipping `/health` and WebSocket upgrades (which
/// authenticate, if at all, via their own query-param convention — cloud
/// mode is left to the operator's reverse proxy per spec.md §4.11).
async fn auth_layer(
    State(state): State<Arc<GatewayState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/health" || path.starts_with("/ws") {
        return next.run(req).await;
    }
    if let Err(code) = validate_bearer(req.headers(), state.auth_token.as_deref()) {
        return error_response(code, "unauthorized");
    }
    next.run(req).await
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ErrorCode> {
    let Some(expected) = expected else { return Ok(()) };
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(ErrorCode::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(ErrorCode::Unauthorized)?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(ErrorCode::Unauthorized)
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// -- POST /api/send -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SendRequest {
    to: String,
    message: String,
    #[serde(default)]
    thread: Option<String>,
    #[serde(default)]
    attachments: Option<serde_json::Value>,
    #[serde(default)]
    from: Option<String>,
}

async fn send_message(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SendRequest>,
) -> Response {
    let sender = req.from.unwrap_or_else(|| "dashboard".to_string());
    let outcome = state
        .router
        .handle_send(
            &sender,
            &req.to,
            req.message,
            MessageKind::Message,
            req.thread,
            None,
            req.attachments,
            MessageMeta::default(),
            now_ms(),
        )
        .await;

    match outcome {
        crate::router::SendOutcome::Ack { message_id, duplicate } => {
            Json(serde_json::json!({ "message_id": message_id, "duplicate": duplicate })).into_response()
        }
        crate::router::SendOutcome::Error(code) => error_response(code, "send failed"),
    }
}

// -- POST /api/upload -----------------------------------------------------------

const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_ATTACHMENT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

#[derive(Debug, Deserialize)]
struct UploadRequest {
    filename: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    id: String,
    path: String,
    bytes_written: usize,
}

async fn upload_attachment(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<UploadRequest>,
) -> Response {
    let ext = std::path::Path::new(&req.filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let Some(ext) = ext.filter(|e| ALLOWED_ATTACHMENT_EXTENSIONS.contains(&e.as_str())) else {
        return error_response(ErrorCode::BadRequest, "unsupported attachment type");
    };

    let decoded = match base64_decode(&req.data) {
        Ok(d) => d,
        Err(e) => return error_response(ErrorCode::BadRequest, format!("invalid base64: {e}")),
    };
    if decoded.len() > MAX_ATTACHMENT_BYTES {
        return error_response(ErrorCode::BadRequest, "attachment too large");
    }

    if let Err(e) = tokio::fs::create_dir_all(&state.attachments_dir).await {
        return error_response(ErrorCode::Internal, format!("could not create attachments dir: {e}"));
    }

    let id = relay_proto::new_message_id(now_ms());
    let short_id = &id[..8.min(id.len())];
    let filename = format!("{short_id}-{}.{ext}", now_ms());
    let dest = state.attachments_dir.join(&filename);
    if let Err(e) = tokio::fs::write(&dest, &decoded).await {
        return error_response(ErrorCode::Internal, format!("failed to write attachment: {e}"));
    }

    Json(UploadResponse {
        id: short_id.to_string(),
        path: dest.to_string_lossy().into_owned(),
        bytes_written: decoded.len(),
    })
    .into_response()
}

fn base64_decode(input: &str) -> Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(input))
        .map_err(|e| e.to_string())
}

/// Evicts attachments with mtime older than `retention_hours` (spec.md §6).
/// Invoked by the daemon's hourly sweep task.
pub async fn evict_stale_attachments(dir: &std::path::Path, retention_hours: u64) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else { return };
    let cutoff = Duration::from_secs(retention_hours * 3600);
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else { continue };
        let Ok(modified) = meta.modified() else { continue };
        if modified.elapsed().map(|age| age > cutoff).unwrap_or(false) {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

// -- GET /api/data --------------------------------------------------------------

#[derive(Debug, Serialize)]
struct DashboardData {
    agents: Vec<AgentRecord>,
    messages: Vec<Message>,
    sessions: Vec<SessionView>,
    summaries: Vec<AgentSummary>,
}

#[derive(Debug, Serialize)]
struct SessionView {
    id: String,
    agent_name: String,
    cli: String,
    started_at_ms: u64,
    ended_at_ms: Option<u64>,
    summary: Option<String>,
    message_count: u32,
    closed_by: Option<String>,
}

impl From<Session> for SessionView {
    fn from(s: Session) -> Self {
        SessionView {
            id: s.id,
            agent_name: s.agent_name,
            cli: s.cli,
            started_at_ms: s.started_at_ms,
            ended_at_ms: s.ended_at_ms,
            summary: s.summary,
            message_count: s.message_count,
            closed_by: s.closed_by,
        }
    }
}

async fn dashboard_data(State(state): State<Arc<GatewayState>>) -> Response {
    let agents = state.registry.snapshot().await;
    let messages = state
        .store
        .get_messages(MessageFilter { limit: Some(200), ..Default::default() })
        .await
        .unwrap_or_default();
    let sessions = state
        .store
        .get_sessions(None, None)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(SessionView::from)
        .collect();

    let mut summaries = Vec::new();
    for agent in &agents {
        if let Ok(Some(summary)) = state.store.get_summary(agent.name.clone()).await {
            summaries.push(summary);
        }
    }

    Json(DashboardData { agents, messages, sessions, summaries }).into_response()
}

// -- GET /api/history/messages --------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct MessageHistoryQuery {
    from: Option<String>,
    to: Option<String>,
    thread: Option<String>,
    since: Option<u64>,
    search: Option<String>,
    limit: Option<u32>,
}

async fn history_messages(
    State(state): State<Arc<GatewayState>>,
    Query(q): Query<MessageHistoryQuery>,
) -> Response {
    let filter = MessageFilter {
        from: q.from,
        to: q.to,
        thread: q.thread,
        since_ms: q.since,
        search: q.search,
        limit: Some(q.limit.unwrap_or(200)),
    };
    match state.store.get_messages(filter).await {
        Ok(messages) => Json(serde_json::json!({ "messages": messages })).into_response(),
        Err(code) => error_response(code, "failed to read message history"),
    }
}

// -- GET /api/history/sessions ---------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct SessionHistoryQuery {
    agent: Option<String>,
    since: Option<u64>,
}

async fn history_sessions(
    State(state): State<Arc<GatewayState>>,
    Query(q): Query<SessionHistoryQuery>,
) -> Response {
    match state.store.get_sessions(q.agent, q.since).await {
        Ok(sessions) => {
            let views: Vec<SessionView> = sessions.into_iter().map(SessionView::from).collect();
            Json(serde_json::json!({ "sessions": views })).into_response()
        }
        Err(code) => error_response(code, "failed to read session history"),
    }
}

// -- GET /api/history/conversations ----------------------------------------------

#[derive(Debug, Serialize, Eq, PartialEq, Hash, Clone)]
struct ConversationPair {
    from: String,
    to: String,
}

async fn history_conversations(State(state): State<Arc<GatewayState>>) -> Response {
    let messages = match state
        .store
        .get_messages(MessageFilter { limit: Some(10_000), ..Default::default() })
        .await
    {
        Ok(m) => m,
        Err(code) => return error_response(code, "failed to read conversation history"),
    };

    let mut seen: HashSet<ConversationPair> = HashSet::new();
    let mut pairs = Vec::new();
    for message in messages {
        let pair = ConversationPair { from: message.from, to: message.to };
        if seen.insert(pair.clone()) {
            pairs.push(pair);
        }
    }

    Json(serde_json::json!({ "conversations": pairs })).into_response()
}

// -- POST /api/spawn / GET+DELETE /api/spawned ------------------------------------

#[derive(Debug, Deserialize)]
struct SpawnRequest {
    name: String,
    cli: String,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    team: Option<String>,
}

async fn spawn_agent(State(state): State<Arc<GatewayState>>, Json(req): Json<SpawnRequest>) -> Response {
    match state
        .spawner
        .spawn(req.name, req.cli, req.task, req.team, std::collections::HashMap::new())
        .await
    {
        Ok(info) => Json(info).into_response(),
        Err(code) => error_response(code, "spawn failed"),
    }
}

async fn list_spawned(State(state): State<Arc<GatewayState>>) -> Response {
    let workers: Vec<WorkerInfo> = state.spawner.list().await;
    Json(serde_json::json!({ "spawned": workers })).into_response()
}

async fn release_spawned(State(state): State<Arc<GatewayState>>, Path(name): Path<String>) -> Response {
    state.spawner.release(&name).await;
    if let Some(session_id) = state.registry.disconnect(&name, now_ms()).await {
        state.sessions.end(&session_id, None, "disconnect", now_ms()).await;
    }
    Json(serde_json::json!({ "released": true, "name": name })).into_response()
}

// -- GET /api/logs/:name ---------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn agent_logs(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Response {
    let lines = state.sessions.tail(&name, q.tail.unwrap_or(200)).await;
    Json(serde_json::json!({ "name": name, "lines": lines })).into_response()
}

// -- GET /ws (dashboard state broadcast) ------------------------------------------

async fn ws_dashboard(State(state): State<Arc<GatewayState>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_WS_FRAME_BYTES)
        .on_upgrade(move |socket| handle_dashboard_socket(socket, state, false))
        .into_response()
}

async fn ws_bridge(State(state): State<Arc<GatewayState>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_WS_FRAME_BYTES)
        .on_upgrade(move |socket| handle_dashboard_socket(socket, state, true))
        .into_response()
}

/// Periodic full-snapshot broadcast. `/ws/bridge` wraps the same snapshot
/// under an `aggregated: true` envelope — this single-project daemon has
/// nothing further to aggregate, but the shape matches what a cross-project
/// bridge would forward.
async fn handle_dashboard_socket(mut socket: WebSocket, state: Arc<GatewayState>, bridge: bool) {
    let mut tick = tokio::time::interval(DASHBOARD_TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let snapshot = build_snapshot(&state).await;
                let envelope = if bridge {
                    serde_json::json!({ "aggregated": true, "data": snapshot })
                } else {
                    serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null)
                };
                if socket.send(WsMessage::Text(envelope.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn build_snapshot(state: &Arc<GatewayState>) -> DashboardData {
    let agents = state.registry.snapshot().await;
    let messages = state
        .store
        .get_messages(MessageFilter { limit: Some(50), ..Default::default() })
        .await
        .unwrap_or_default();
    let sessions = state
        .store
        .get_sessions(None, None)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(SessionView::from)
        .collect();
    let mut summaries = Vec::new();
    for agent in &agents {
        if let Ok(Some(summary)) = state.store.get_summary(agent.name.clone()).await {
            summaries.push(summary);
        }
    }
    DashboardData { agents, messages, sessions, summaries }
}

// -- GET /ws/logs/:name ------------------------------------------------------------

async fn ws_logs(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.sessions.has_agent(&name).await && !state.registry.is_online(&name).await {
        return ws
            .max_message_size(MAX_WS_FRAME_BYTES)
            .on_upgrade(move |socket| close_unknown_agent(socket))
            .into_response();
    }
    ws.max_message_size(MAX_WS_FRAME_BYTES)
        .on_upgrade(move |socket| handle_log_socket(socket, state, name))
        .into_response()
}

async fn close_unknown_agent(mut socket: WebSocket) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: CLOSE_UNKNOWN_AGENT,
            reason: "unknown agent".into(),
        })))
        .await;
}

async fn handle_log_socket(mut socket: WebSocket, state: Arc<GatewayState>, name: String) {
    let mut rx = state.sessions.subscribe(&name).await;
    let mut ping = tokio::time::interval(LOG_PING_INTERVAL);
    for line in state.sessions.tail(&name, 200).await {
        if socket.send(WsMessage::Text(line.into())).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            _ = ping.tick() => {
                if socket.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            line = rx.recv() => {
                match line {
                    Ok(line) => {
                        if socket.send(WsMessage::Text(line.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

// -- GET /ws/presence ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum PresenceEvent {
    Joined { name: String },
    Left { name: String },
}

async fn ws_presence(State(state): State<Arc<GatewayState>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_WS_FRAME_BYTES)
        .on_upgrade(move |socket| handle_presence_socket(socket, state))
        .into_response()
}

/// Polls registry presence and emits join/leave deltas. Typing events would
/// require a wire frame the protocol doesn't define (spec.md §4.1/§6 list no
/// `typing` frame), so only join/leave are implemented here.
async fn handle_presence_socket(mut socket: WebSocket, state: Arc<GatewayState>) {
    let mut known: HashSet<String> = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .filter(|r| matches!(r.state, ConnState::Connected))
        .map(|r| r.name)
        .collect();
    let mut poll = tokio::time::interval(PRESENCE_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                let online: HashSet<String> = state
                    .registry
                    .snapshot()
                    .await
                    .into_iter()
                    .filter(|r| matches!(r.state, ConnState::Connected))
                    .map(|r| r.name)
                    .collect();
                for joined in online.difference(&known) {
                    let event = PresenceEvent::Joined { name: joined.clone() };
                    if send_presence(&mut socket, &event).await.is_err() {
                        return;
                    }
                }
                for left in known.difference(&online) {
                    let event = PresenceEvent::Left { name: left.clone() };
                    if send_presence(&mut socket, &event).await.is_err() {
                        return;
                    }
                }
                known = online;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_presence(socket: &mut WebSocket, event: &PresenceEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    socket.send(WsMessage::Text(text.into())).await
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
