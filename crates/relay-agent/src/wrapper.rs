// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI wrapper (C9): the state machine that owns one multiplexer pane
//! and drives the output parser (C6), idle detector (C7), and injector
//! (C8) against it, relaying parsed commands and inbound deliveries
//! through the C5 socket client (spec.md §4.9). Generic over
//! [`PaneOps`] so the whole poll loop can be driven against a fake pane
//! in tests, the same split the teacher keeps between `pty::Backend`
//! and its `driver::composite::CompositeDetector` consumer.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::Regex;
use relay_proto::{ClientFrame, MessageKind, ServerFrame};
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::RelayClient;
use crate::idle::IdleDetector;
use crate::injector::{CliProfile, Injector};
use crate::pane::PaneOps;
use crate::parser::{Emission, Parser, Recipient};

/// `idle → starting → running ↔ waiting-idle → stopping → stopped`
/// (spec.md §4.9). A `start` from `Running` is a no-op; `stop` is
/// idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperState {
    Idle,
    Starting,
    Running,
    WaitingIdle,
    Stopping,
    Stopped,
}

/// Throttle for the auth-revoked pattern check (spec.md §4.9: "throttled
/// checks").
const AUTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);

// Compile-time-constant pattern; a failure here is a programming error.
#[allow(clippy::expect_used)]
static AUTH_REVOKED_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)session (has been |was )?terminated|authentication (has )?expired|please (log|sign) in again|re-?authenticate|token (has )?expired")
        .expect("valid regex")
});

pub struct Wrapper<P: PaneOps> {
    pane: P,
    name: String,
    parser: Parser,
    idle: IdleDetector,
    injector: Injector,
    client: RelayClient,
    state: WrapperState,
    last_text: String,
    last_auth_check: Instant,
    auth_revoked: bool,
}

impl<P: PaneOps> Wrapper<P> {
    pub fn new(
        pane: P,
        name: String,
        cli: &str,
        idle_threshold: f64,
        inbox_path: Option<PathBuf>,
        client: RelayClient,
    ) -> Self {
        Self {
            pane,
            name,
            parser: Parser::new(),
            idle: IdleDetector::new(idle_threshold),
            injector: Injector::new(CliProfile::for_cli(cli), inbox_path),
            client,
            state: WrapperState::Idle,
            last_text: String::new(),
            last_auth_check: Instant::now(),
            auth_revoked: false,
        }
    }

    pub fn state(&self) -> WrapperState {
        self.state
    }

    pub fn is_auth_revoked(&self) -> bool {
        self.auth_revoked
    }

    /// Connects to the daemon and transitions `Idle`/`Stopped` → `Starting`
    /// → `Running`. A call while already `Running` is a no-op.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.state == WrapperState::Running {
            return Ok(());
        }
        self.state = WrapperState::Starting;
        self.client.connect().await?;
        self.state = WrapperState::Running;
        Ok(())
    }

    /// Runs the poll loop until `shutdown` fires, then drives the
    /// `Stopping` → `Stopped` transition (spec.md §5: "within a 1 s
    /// budget").
    pub async fn run(&mut self, poll_interval: Duration, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.poll_once().await,
            }
        }
        self.state = WrapperState::Stopping;
        self.pane.kill().await;
        self.state = WrapperState::Stopped;
    }

    /// One iteration: capture, feed C6/C7, forward parsed emissions,
    /// drain inbound deliveries into the injector, and tick the injector
    /// (spec.md §4.9 bullets 4-6).
    async fn poll_once(&mut self) {
        let Ok(text) = self.pane.capture().await else {
            return;
        };
        if text.len() != self.last_text.len() || text != self.last_text {
            self.idle.note_output();
            let new_suffix = new_tail(&self.last_text, &text);
            if !new_suffix.is_empty() {
                self.client.send(ClientFrame::Log { body: new_suffix }).await;
            }
            self.check_auth_revoked(&text).await;
            self.last_text = text.clone();
        }

        for emission in self.parser.feed(&text) {
            self.handle_emission(emission).await;
        }

        let pid = self.pane.pane_pid().await;
        let sample = self.idle.sample(pid, &text);
        self.state = match (self.state, sample.is_idle) {
            (WrapperState::Running, true) => WrapperState::WaitingIdle,
            (WrapperState::WaitingIdle, false) => WrapperState::Running,
            (other, _) => other,
        };

        while let Some(frame) = self.client.try_recv().await {
            self.handle_inbound(frame);
        }

        if !self.auth_revoked {
            let _ = self.injector.tick(&self.pane, crate::time::now_ms()).await;
        }

        self.client.send(ClientFrame::Heartbeat).await;
    }

    async fn handle_emission(&mut self, emission: Emission) {
        match emission {
            Emission::Relay(cmd) => self.forward_relay_command(cmd).await,
            Emission::Summary(summary) => {
                self.client
                    .send(ClientFrame::Summary {
                        current_task: summary.current_task,
                        completed_tasks: summary.completed_tasks,
                        context: summary.context,
                        decisions: summary.decisions,
                        files: summary.files,
                    })
                    .await;
            }
            Emission::SessionEnd(end) => {
                self.client
                    .send(ClientFrame::SessionEnd {
                        summary: end.summary,
                        completed_tasks: end.completed_tasks,
                    })
                    .await;
            }
            Emission::MalformedSummary { error, .. } => {
                warn!(agent = %self.name, error, "malformed [[SUMMARY]] block");
            }
            Emission::MalformedSessionEnd { error, .. } => {
                warn!(agent = %self.name, error, "malformed [[SESSION_END]] block");
            }
        }
    }

    async fn forward_relay_command(&mut self, cmd: crate::parser::RelayCommand) {
        let to = match cmd.recipient {
            Recipient::All => "*".to_string(),
            Recipient::Team(team) => format!("team:{team}"),
            Recipient::Channel(channel) => format!("#{channel}"),
            Recipient::Agent(agent) => agent,
            // `spawn`/`release`/`continuity:*` are accepted syntax but not
            // yet wired to the spawner over the socket protocol; the
            // dashboard's HTTP API remains the authoritative control
            // surface for worker lifecycle (see DESIGN.md).
            Recipient::Spawn | Recipient::Release | Recipient::Continuity(_) => {
                warn!(agent = %self.name, "relay control verb not forwarded over the socket protocol");
                return;
            }
        };
        self.client
            .send(ClientFrame::Send {
                to,
                body: cmd.body,
                kind: Some(MessageKind::Message),
                thread: None,
                channel: None,
                data: None,
                meta: relay_proto::MessageMeta {
                    importance: cmd.meta.importance,
                    reply_to: cmd.meta.reply_to,
                    requires_ack: cmd.meta.ack,
                    ttl_ms: None,
                },
            })
            .await;
    }

    fn handle_inbound(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Deliver { message, .. } => {
                self.injector.enqueue(message.from, message.body);
            }
            ServerFrame::Error { body, .. } => {
                warn!(agent = %self.name, code = ?body.code, message = %body.message, "daemon reported an error");
            }
            ServerFrame::Welcome { .. } | ServerFrame::Ack { .. } | ServerFrame::Presence { .. } => {}
        }
    }

    /// Throttled check for provider-authentication-revoked phrasing
    /// (spec.md §4.9). Once tripped, stays revoked until an operator
    /// releases and respawns the worker (C10) — there is no in-band
    /// reset frame.
    async fn check_auth_revoked(&mut self, text: &str) {
        if self.auth_revoked || self.last_auth_check.elapsed() < AUTH_CHECK_INTERVAL {
            return;
        }
        self.last_auth_check = Instant::now();
        let tripped = AUTH_REVOKED_PATTERNS.is_match(tail_chars(text, 500));
        if !tripped {
            return;
        }
        self.auth_revoked = true;
        info!(agent = %self.name, "provider authentication appears revoked");
        self.client
            .send(ClientFrame::Send {
                to: "__system".to_string(),
                body: format!("agent {} appears to have lost CLI authentication", self.name),
                kind: Some(MessageKind::System),
                thread: None,
                channel: None,
                data: None,
                meta: relay_proto::MessageMeta::default(),
            })
            .await;
    }
}

fn new_tail<'a>(old: &str, new: &'a str) -> String {
    if new.len() > old.len() && new.starts_with(old) {
        new[old.len()..].to_string()
    } else {
        new.to_string()
    }
}

fn tail_chars(text: &str, n: usize) -> &str {
    let floor = text.len().saturating_sub(n);
    let start = (floor..=text.len()).find(|&i| text.is_char_boundary(i)).unwrap_or(text.len());
    &text[start..]
}

#[cfg(test)]
#[path = "wrapper_tests.rs"]
mod tests;
