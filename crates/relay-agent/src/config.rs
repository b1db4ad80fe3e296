// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI wrapper configuration (C9), generalized from the daemon's own
//! `Config` derive (`relay_daemon::config`): every field the spawner
//! (C10) passes as an environment variable gets a documented default
//! here instead of a buried constant, so the wrapper is also runnable
//! standalone for manual testing.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "relay-agent", version, about = "Agent Relay CLI wrapper")]
pub struct Config {
    /// This agent's declared name (spec.md §3: 1-64 chars, `[A-Za-z0-9_.-]`).
    #[arg(long, env = "RELAY_AGENT_NAME")]
    pub name: String,

    /// The wrapped CLI command to launch inside the multiplexer pane
    /// (e.g. `claude`, `codex`, `gemini`). Also used to pick the
    /// injector's prompt-matching profile.
    #[arg(long, env = "RELAY_AGENT_CLI", default_value = "generic")]
    pub cli: String,

    /// Extra arguments passed to the wrapped CLI command, space separated.
    #[arg(long, env = "RELAY_AGENT_CLI_ARGS", default_value = "")]
    pub cli_args: String,

    /// Declared task/role, surfaced in presence and HELLO.
    #[arg(long, env = "RELAY_AGENT_TASK")]
    pub task: Option<String>,

    /// Declared team tag, used by `team:<name>` recipient expansion.
    #[arg(long, env = "RELAY_AGENT_TEAM")]
    pub team: Option<String>,

    /// Unix socket of the relay daemon to connect to.
    #[arg(long, env = "RELAY_SOCKET")]
    pub socket: PathBuf,

    /// Pane-poll cadence in milliseconds (spec.md §4.9 default 200ms).
    #[arg(long, env = "RELAY_AGENT_POLL_MS", default_value_t = 200)]
    pub poll_ms: u64,

    /// Idle-confidence threshold (spec.md §4.7 default 0.7).
    #[arg(long, env = "RELAY_AGENT_IDLE_THRESHOLD", default_value_t = 0.7)]
    pub idle_threshold: f64,

    /// Optional fallback inbox file, appended to when the injector
    /// exhausts its retries (spec.md §6).
    #[arg(long, env = "RELAY_AGENT_INBOX")]
    pub inbox_path: Option<PathBuf>,

    /// Daemon reconnect back-off floor in milliseconds.
    #[arg(long, env = "RELAY_AGENT_RECONNECT_MS", default_value_t = 500)]
    pub reconnect_backoff_ms: u64,

    /// Log output format: `json` or `text`.
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level / `tracing-subscriber` env-filter directive.
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Mirrors `relay_daemon::registry::is_valid_agent_name` (spec.md §3):
/// 1-64 chars, `[A-Za-z0-9_\-.]`, `*` reserved for broadcast. Duplicated
/// here rather than depending on `relay-daemon` since this crate is the
/// daemon's *client*, not its caller.
fn is_valid_agent_name(name: &str) -> bool {
    if name == "*" || name.is_empty() || name.len() > 64 {
        return false;
    }
    name.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_valid_agent_name(&self.name) {
            anyhow::bail!("invalid agent name: {}", self.name);
        }
        if !(0.0..=1.0).contains(&self.idle_threshold) {
            anyhow::bail!("idle_threshold must be within [0.0, 1.0]");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("log_format must be 'json' or 'text'");
        }
        Ok(())
    }

    pub fn cli_args(&self) -> Vec<String> {
        self.cli_args.split_whitespace().map(str::to_string).collect()
    }

    pub fn session_name(&self) -> String {
        format!("relay-{}", self.name)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
