// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection task (C5): reads `ClientFrame`s from one socket, drives
//! them through the router's state machine, and writes `ServerFrame`s back.
//! Shaped like the teacher's session select-loop (`session/run.rs`): one
//! `tokio::select!` over inbound frames, outbound frames, and the shutdown
//! token, with an explicit enum transition function rather than a
//! state-machine crate (`driver::composite::CompositeDetector`'s style).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_proto::{ClientFrame, ErrorCode, FrameCodec, ServerFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::is_valid_agent_name;
use crate::router::{ConnEvent, ConnState, Router};
use crate::sessions::SessionTracker;
use crate::store::{AgentRow, AgentSummary};
use crate::time::now_ms;

pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const PROTOCOL_ERROR_LIMIT: u32 = 3;
const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(10);

/// Drives one connection end to end. `io` must be split-capable
/// (`AsyncRead + AsyncWrite`), true of both `UnixStream` and, for tests,
/// an in-memory duplex pipe.
pub async fn run_connection<IO>(
    io: IO,
    router: Arc<Router>,
    sessions: Arc<SessionTracker>,
    shutdown: CancellationToken,
) where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(io, FrameCodec::<serde_json::Value>::default());
    let mut state = ConnState::New;
    let mut error_times: Vec<tokio::time::Instant> = Vec::new();
    let conn_cancel = CancellationToken::new();

    let hello = tokio::time::timeout(HELLO_TIMEOUT, next_client_frame(&mut framed)).await;
    let hello_frame = match hello {
        Ok(Some(Ok(frame))) => frame,
        _ => {
            let _ = send_raw(&mut framed, &ServerFrame::Error {
                body: ErrorCode::FrameMalformed.body("no HELLO within timeout"),
                terminal: true,
            }).await;
            return;
        }
    };

    let ClientFrame::Hello { name, cli, task, team } = hello_frame else {
        let _ = send_raw(&mut framed, &ServerFrame::Error {
            body: ErrorCode::Forbidden.body("first frame must be HELLO"),
            terminal: true,
        }).await;
        return;
    };

    if !is_valid_agent_name(&name) {
        let _ = send_raw(&mut framed, &ServerFrame::Error {
            body: ErrorCode::Forbidden.body("invalid agent name"),
            terminal: true,
        }).await;
        state = state.advance(ConnEvent::InvalidHello).unwrap_or(ConnState::Closed);
        debug_assert_eq!(state, ConnState::Closed);
        return;
    }
    state = state.advance(ConnEvent::ValidHello).unwrap_or(ConnState::Closed);
    debug_assert_eq!(state, ConnState::Ready);

    let now = now_ms();
    let cli = cli.unwrap_or_else(|| "unknown".to_string());
    let outcome = router.registry().hello(&name, &cli, task, team, now).await;
    if outcome.superseded {
        info!(agent = %name, "HELLO superseded a live connection");
    }
    let _ = router.store().upsert_agent(AgentRow {
        name: outcome.record.name.clone(),
        cli: outcome.record.cli.clone(),
        first_seen_ms: outcome.record.first_seen_ms,
        last_seen_ms: outcome.record.last_seen_ms,
        messages_sent: outcome.record.messages_sent,
        messages_received: outcome.record.messages_received,
        team: outcome.record.team.clone(),
    }).await;
    router.publish("presence", serde_json::json!({"agent": name, "state": "connected"})).await;

    let session_id = sessions.open(&name, &cli, now).await;
    router.registry().set_session(&name, Some(session_id.clone())).await;

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(router.hard_limit());
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ServerFrame>();
    if let Some(old_cancel) = router.register(&name, out_tx, conn_cancel.clone(), control_tx).await {
        old_cancel.cancel();
    }
    let _ = send_raw(&mut framed, &ServerFrame::Welcome { session_id: session_id.clone() }).await;

    let close_reason;
    loop {
        let soft_pause = router
            .queue_headroom(&name)
            .await
            .is_some_and(|headroom| headroom < router.hard_limit().saturating_sub(router.soft_limit()));

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                let _ = send_raw(&mut framed, &ServerFrame::Error {
                    body: ErrorCode::ServerShutdown.body("daemon shutting down"),
                    terminal: true,
                }).await;
                close_reason = "error";
                break;
            }
            control = control_rx.recv() => {
                if let Some(frame) = control {
                    let _ = send_raw(&mut framed, &frame).await;
                }
                close_reason = "error";
                break;
            }
            _ = conn_cancel.cancelled() => {
                close_reason = "error";
                break;
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => { let _ = send_raw(&mut framed, &frame).await; }
                    None => { close_reason = "error"; break; }
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(50)), if soft_pause => {
                // Backpressure: pause reading from this one connection until
                // its outbound queue drains below the soft watermark
                // (spec.md §4.4 backpressure — never pauses other conns).
            }
            frame = next_client_frame(&mut framed), if !soft_pause => {
                match frame {
                    Some(Ok(frame)) => {
                        router.registry().touch(&name, now_ms()).await;
                        match handle_ready_frame(&router, &sessions, &name, frame, &mut framed).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Bye => { close_reason = "agent"; break; }
                            FrameOutcome::ProtocolError => {
                                if record_protocol_error(&mut error_times) {
                                    warn!(agent = %name, "repeated protocol errors; closing");
                                    close_reason = "error";
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(ClientFrameDecodeError::UnknownType(type_str))) => {
                        let _ = send_raw(&mut framed, &ServerFrame::Error {
                            body: ErrorCode::UnknownFrameType.body(format!("unknown frame type '{type_str}'")),
                            terminal: false,
                        }).await;
                        if record_protocol_error(&mut error_times) {
                            warn!(agent = %name, "repeated protocol errors; closing");
                            close_reason = "error";
                            break;
                        }
                    }
                    Some(Err(ClientFrameDecodeError::Malformed(_))) => { close_reason = "error"; break; }
                    None => { close_reason = "disconnect"; break; }
                }
            }
        }
    }

    router.unregister(&name).await;
    // A superseding HELLO already disconnected/replaced this record and
    // opened its own session; don't clobber that with this connection's
    // own (stale) close reason.
    if !conn_cancel.is_cancelled() {
        let now = now_ms();
        if router.registry().disconnect(&name, now).await.is_some() {
            sessions.end(&session_id, None, close_reason, now).await;
        }
        if let Some(record) = router.registry().get(&name).await {
            let _ = router.store().upsert_agent(AgentRow {
                name: record.name,
                cli: record.cli,
                first_seen_ms: record.first_seen_ms,
                last_seen_ms: record.last_seen_ms,
                messages_sent: record.messages_sent,
                messages_received: record.messages_received,
                team: record.team,
            }).await;
        }
        router.publish("presence", serde_json::json!({"agent": name, "state": "disconnected"})).await;
    }
}

enum FrameOutcome {
    Continue,
    Bye,
    ProtocolError,
}

async fn handle_ready_frame<IO>(
    router: &Arc<Router>,
    sessions: &Arc<SessionTracker>,
    name: &str,
    frame: ClientFrame,
    framed: &mut Framed<IO, FrameCodec<serde_json::Value>>,
) -> FrameOutcome
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    match frame {
        ClientFrame::Hello { .. } => {
            let _ = send_raw(framed, &ServerFrame::Error {
                body: ErrorCode::UnknownFrameType.body("HELLO only valid as the first frame"),
                terminal: false,
            }).await;
            FrameOutcome::ProtocolError
        }
        ClientFrame::Send { to, body, kind, thread, channel, data, meta } => {
            use crate::router::SendOutcome;
            let outcome = router
                .handle_send(
                    name,
                    &to,
                    body,
                    kind.unwrap_or(relay_proto::MessageKind::Message),
                    thread,
                    channel,
                    data,
                    meta,
                    now_ms(),
                )
                .await;
            match outcome {
                SendOutcome::Ack { message_id, duplicate } => {
                    let _ = send_raw(framed, &ServerFrame::Ack { message_id, duplicate }).await;
                }
                SendOutcome::Error(code) => {
                    let terminal = code.is_terminal();
                    let _ = send_raw(framed, &ServerFrame::Error {
                        body: code.body("send failed"),
                        terminal,
                    }).await;
                }
            }
            FrameOutcome::Continue
        }
        ClientFrame::Ack { message_id } => {
            router.handle_ack(&message_id).await;
            FrameOutcome::Continue
        }
        ClientFrame::Subscribe { topic } => {
            router.subscribe(name, topic).await;
            FrameOutcome::Continue
        }
        ClientFrame::Unsubscribe { topic } => {
            router.unsubscribe(name, &topic).await;
            FrameOutcome::Continue
        }
        ClientFrame::Heartbeat => FrameOutcome::Continue,
        ClientFrame::Log { body } => {
            sessions.tail_log(name, &body).await;
            router.publish(&format!("agent/{name}/logs"), serde_json::json!({"line": body})).await;
            FrameOutcome::Continue
        }
        ClientFrame::Summary { current_task, completed_tasks, context, decisions, files } => {
            let summary = AgentSummary {
                agent_name: name.to_string(),
                project_id: None,
                last_updated_ms: now_ms(),
                current_task,
                completed_tasks,
                decisions,
                context,
                files,
            };
            let _ = router.store().upsert_summary(summary).await;
            FrameOutcome::Continue
        }
        ClientFrame::SessionEnd { summary, completed_tasks } => {
            if let Some(session_id) = router.registry().get(name).await.and_then(|r| r.session_id) {
                sessions.end(&session_id, Some(summary), "agent", now_ms()).await;
                router.registry().set_session(name, None).await;
            }
            if !completed_tasks.is_empty() {
                let mut existing = router
                    .store()
                    .get_summary(name.to_string())
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| AgentSummary {
                        agent_name: name.to_string(),
                        ..Default::default()
                    });
                existing.completed_tasks.extend(completed_tasks);
                existing.last_updated_ms = now_ms();
                let _ = router.store().upsert_summary(existing).await;
            }
            FrameOutcome::Continue
        }
        ClientFrame::Bye => FrameOutcome::Bye,
    }
}

/// `type` strings `ClientFrame` actually knows how to decode. Checked
/// against the raw value before deserializing so a frame with an
/// unrecognized `type` can be told apart from one that's simply malformed.
const KNOWN_CLIENT_FRAME_TYPES: &[&str] = &[
    "hello", "send", "ack", "subscribe", "unsubscribe", "heartbeat", "log", "summary",
    "session_end", "bye",
];

enum ClientFrameDecodeError {
    /// `type` is a string, but not one `ClientFrame` knows (recoverable).
    UnknownType(String),
    Malformed(relay_proto::FrameError),
}

async fn next_client_frame<IO>(
    framed: &mut Framed<IO, FrameCodec<serde_json::Value>>,
) -> Option<Result<ClientFrame, ClientFrameDecodeError>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(value)) => {
            if let Some(type_str) = value.get("type").and_then(|t| t.as_str()) {
                if !KNOWN_CLIENT_FRAME_TYPES.contains(&type_str) {
                    return Some(Err(ClientFrameDecodeError::UnknownType(type_str.to_string())));
                }
            }
            Some(
                serde_json::from_value(value)
                    .map_err(|e| ClientFrameDecodeError::Malformed(relay_proto::FrameError::Malformed(e.to_string()))),
            )
        }
        Some(Err(e)) => Some(Err(ClientFrameDecodeError::Malformed(e))),
        None => None,
    }
}

/// Pushes a protocol-error timestamp and reports whether the rolling
/// ≥N-in-`PROTOCOL_ERROR_WINDOW` threshold has now been crossed.
fn record_protocol_error(error_times: &mut Vec<tokio::time::Instant>) -> bool {
    error_times.push(tokio::time::Instant::now());
    error_times.retain(|t| t.elapsed() < PROTOCOL_ERROR_WINDOW);
    error_times.len() as u32 >= PROTOCOL_ERROR_LIMIT
}

async fn send_raw<IO>(
    framed: &mut Framed<IO, FrameCodec<serde_json::Value>>,
    frame: &ServerFrame,
) -> std::io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let value = serde_json::to_value(frame).unwrap_or(serde_json::Value::Null);
    framed
        .send(value)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
