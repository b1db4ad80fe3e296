// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The wrapper's connection to the relay daemon's Unix socket (C9's "C5
//! client"), shaped like the daemon's own per-connection task
//! (`relay_daemon::connection::run_connection`) run in reverse: send
//! `HELLO`, await `Welcome`, then exchange `ClientFrame`/`ServerFrame`
//! over a length-prefixed `Framed` stream. Owns a bounded offline buffer
//! so a `Send` issued while the daemon is unreachable replays, in
//! insertion order, once the connection comes back (spec.md §4.9).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_proto::{ClientFrame, FrameCodec, ServerFrame};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

/// Bound on buffered outbound frames while the daemon is unreachable.
pub const DEFAULT_OFFLINE_BUFFER_CAP: usize = 256;

type WireFramed = Framed<UnixStream, FrameCodec<serde_json::Value>>;

pub struct RelayClient {
    socket_path: PathBuf,
    name: String,
    cli: String,
    task: Option<String>,
    team: Option<String>,
    framed: Option<WireFramed>,
    offline_buffer: VecDeque<ClientFrame>,
    offline_cap: usize,
}

impl RelayClient {
    pub fn new(
        socket_path: PathBuf,
        name: String,
        cli: String,
        task: Option<String>,
        team: Option<String>,
    ) -> Self {
        Self {
            socket_path,
            name,
            cli,
            task,
            team,
            framed: None,
            offline_buffer: VecDeque::new(),
            offline_cap: DEFAULT_OFFLINE_BUFFER_CAP,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    pub fn buffered_len(&self) -> usize {
        self.offline_buffer.len()
    }

    /// Connects to the socket, sends `HELLO`, and waits for `Welcome`.
    /// Flushes any buffered frames afterward.
    pub async fn connect(&mut self) -> anyhow::Result<String> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let mut framed = Framed::new(stream, FrameCodec::<serde_json::Value>::default());
        let hello = ClientFrame::Hello {
            name: self.name.clone(),
            cli: Some(self.cli.clone()),
            task: self.task.clone(),
            team: self.team.clone(),
        };
        send_frame(&mut framed, &hello).await?;
        let session_id = match next_frame(&mut framed).await? {
            Some(ServerFrame::Welcome { session_id }) => session_id,
            Some(other) => anyhow::bail!("expected Welcome, got {other:?}"),
            None => anyhow::bail!("connection closed before Welcome"),
        };
        self.framed = Some(framed);
        self.flush_offline_buffer().await;
        Ok(session_id)
    }

    /// Sends a frame, buffering it for later replay if the daemon is
    /// currently unreachable (spec.md §4.9: "enqueue up to a bounded
    /// offline buffer and replay on reconnect in insertion order").
    pub async fn send(&mut self, frame: ClientFrame) {
        if let Some(framed) = self.framed.as_mut() {
            if send_frame(framed, &frame).await.is_ok() {
                return;
            }
            self.framed = None;
        }
        self.buffer(frame);
    }

    fn buffer(&mut self, frame: ClientFrame) {
        if self.offline_buffer.len() >= self.offline_cap {
            self.offline_buffer.pop_front();
        }
        self.offline_buffer.push_back(frame);
    }

    async fn flush_offline_buffer(&mut self) {
        while let Some(frame) = self.offline_buffer.pop_front() {
            let Some(framed) = self.framed.as_mut() else {
                self.offline_buffer.push_front(frame);
                break;
            };
            if send_frame(framed, &frame).await.is_err() {
                self.framed = None;
                self.offline_buffer.push_front(frame);
                break;
            }
        }
    }

    /// Non-blocking poll for the next inbound frame. Returns `None` if
    /// disconnected or nothing is pending right now; marks the connection
    /// disconnected on a read error or stream close.
    pub async fn try_recv(&mut self) -> Option<ServerFrame> {
        let framed = self.framed.as_mut()?;
        match tokio::time::timeout(Duration::from_millis(1), framed.next()).await {
            Ok(Some(Ok(value))) => serde_json::from_value(value).ok(),
            Ok(Some(Err(_))) | Ok(None) => {
                self.framed = None;
                None
            }
            Err(_) => None,
        }
    }
}

async fn send_frame(framed: &mut WireFramed, frame: &ClientFrame) -> anyhow::Result<()> {
    let value = serde_json::to_value(frame)?;
    framed.send(value).await.map_err(|e| anyhow::anyhow!(e.to_string()))
}

async fn next_frame(framed: &mut WireFramed) -> anyhow::Result<Option<ServerFrame>> {
    match framed.next().await {
        Some(Ok(value)) => Ok(Some(serde_json::from_value(value)?)),
        Some(Err(e)) => Err(anyhow::anyhow!(e.to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
