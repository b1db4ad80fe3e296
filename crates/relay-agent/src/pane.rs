// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owns one tmux session per agent, generalized from the teacher's
//! `pty::attach::TmuxBackend` (`crates/cli/src/pty/attach.rs`): there it is
//! a compatibility fallback that attaches to an existing session; here it
//! is promoted to the wrapper's only backend (C9 "owns a terminal
//! multiplexer pane per agent", spec.md §4.9).

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::process::Command;

/// Narrow, object-safe view of a pane the injector and idle detector need,
/// mirroring the teacher's `pty::Backend` trait shape (boxed futures
/// instead of `async fn` so it stays dyn-compatible) so both can be
/// exercised against a fake in tests without a real tmux binary.
pub trait PaneOps: Send + Sync {
    fn capture(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;
    fn cursor_column(&self) -> Pin<Box<dyn Future<Output = Option<u16>> + Send + '_>>;
    fn send_literal(&self, text: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
    fn send_enter(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
    fn pane_pid(&self) -> Pin<Box<dyn Future<Output = Option<u32>> + Send + '_>>;
    /// Tears down the underlying session, if any. A no-op for panes that
    /// don't own a session of their own (e.g. a test fake).
    fn kill(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// A plain-text, ANSI-free capture of a pane's scrollback-inclusive buffer,
/// with wrapped lines already rejoined (tmux `-J`).
pub struct Pane {
    session: String,
}

impl Pane {
    /// Returns whether a tmux session by this name currently exists.
    pub async fn session_exists(session: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", session])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Kills an existing session by name, ignoring the case where none
    /// exists.
    pub async fn kill_session(session: &str) {
        let _ = Command::new("tmux")
            .args(["kill-session", "-t", session])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
    }

    /// Starts a fresh named session running `command` with `args`, killing
    /// any pre-existing session of the same name first (spec.md §4.9: "one
    /// live agent per name").
    pub async fn spawn(
        session: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&PathBuf>,
    ) -> anyhow::Result<Self> {
        if Self::session_exists(session).await {
            Self::kill_session(session).await;
        }
        let mut cmd = Command::new("tmux");
        cmd.args(["new-session", "-d", "-s", session]);
        if let Some(dir) = cwd {
            cmd.args(["-c", &dir.to_string_lossy()]);
        }
        cmd.arg(command);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }
        let status = cmd
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux new-session failed for '{session}'");
        }
        let pane = Self { session: session.to_string() };
        pane.apply_session_options().await;
        Ok(pane)
    }

    /// Large scrollback, mouse scroll passthrough, clipboard integration,
    /// and tall status lines for long prompts (spec.md §4.9).
    async fn apply_session_options(&self) {
        let options: &[(&str, &str)] = &[
            ("history-limit", "100000"),
            ("mouse", "on"),
            ("set-clipboard", "on"),
            ("status", "off"),
        ];
        for (key, value) in options {
            let _ = Command::new("tmux")
                .args(["set-option", "-t", &self.session, key, value])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .await;
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Captures the full scrollback buffer as plain text, no escape
    /// sequences, wrapped lines rejoined.
    pub async fn capture(&self) -> anyhow::Result<String> {
        let output = Command::new("tmux")
            .args(["capture-pane", "-p", "-J", "-S", "-", "-t", &self.session])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!("tmux capture-pane failed for '{}'", self.session);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Writes raw bytes into the pane via `send-keys -l` (literal, no key
    /// name interpretation).
    pub async fn send_literal(&self, text: &str) -> anyhow::Result<()> {
        let status = Command::new("tmux")
            .args(["send-keys", "-l", "-t", &self.session, text])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux send-keys failed for '{}'", self.session);
        }
        Ok(())
    }

    pub async fn send_enter(&self) -> anyhow::Result<()> {
        let status = Command::new("tmux")
            .args(["send-keys", "-t", &self.session, "Enter"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux send-keys Enter failed for '{}'", self.session);
        }
        Ok(())
    }

    /// Cursor column of the active pane, or `None` if the session is gone.
    pub async fn cursor_column(&self) -> Option<u16> {
        let output = Command::new("tmux")
            .args(["display-message", "-p", "-t", &self.session, "#{cursor_x}"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }

    /// PID of the pane's foreground process.
    pub async fn pane_pid(&self) -> Option<u32> {
        let output = Command::new("tmux")
            .args(["display-message", "-p", "-t", &self.session, "#{pane_pid}"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let status = Command::new("tmux")
            .args([
                "resize-pane",
                "-t",
                &self.session,
                "-x",
                &cols.to_string(),
                "-y",
                &rows.to_string(),
            ])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux resize-pane failed for '{}'", self.session);
        }
        Ok(())
    }

    pub async fn kill(&self) {
        Self::kill_session(&self.session).await;
    }
}

impl PaneOps for Pane {
    fn capture(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        Box::pin(self.capture())
    }

    fn cursor_column(&self) -> Pin<Box<dyn Future<Output = Option<u16>> + Send + '_>> {
        Box::pin(self.cursor_column())
    }

    fn send_literal(&self, text: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let text = text.to_string();
        Box::pin(async move { self.send_literal(&text).await })
    }

    fn send_enter(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(self.send_enter())
    }

    fn pane_pid(&self) -> Pin<Box<dyn Future<Output = Option<u32>> + Send + '_>> {
        Box::pin(self.pane_pid())
    }

    fn kill(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.kill())
    }
}
