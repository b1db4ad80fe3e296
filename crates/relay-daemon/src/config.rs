// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration, generalized from the CLI wrapper's `Config`
//! derive: every socket path, port, timeout, and threshold named in
//! `SPEC_FULL.md` §4 is a field here with a documented default, not a
//! buried constant.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "relayd", version, about = "Agent Relay coordination daemon")]
pub struct Config {
    /// Path to the project directory the daemon coordinates for. Used to
    /// derive the default socket path and data directory.
    #[arg(long, env = "RELAY_PROJECT_DIR", default_value = ".")]
    pub project_dir: PathBuf,

    /// Unix domain socket path. Defaults to a project-scoped path under
    /// the data directory (`SPEC_FULL.md` / spec.md §6).
    #[arg(long, env = "RELAY_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Root data directory holding `store.db`, `team/`, and `attachments/`.
    #[arg(long, env = "RELAY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// HTTP + WebSocket dashboard gateway bind address.
    #[arg(long, env = "RELAY_HTTP_ADDR", default_value = "127.0.0.1:8787")]
    pub http_addr: String,

    /// Bearer token required on the dashboard gateway. Unset disables auth.
    #[arg(long, env = "RELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Heartbeat timeout in milliseconds (spec §4.3 default 30s).
    #[arg(long, env = "RELAY_HEARTBEAT_TIMEOUT_MS", default_value_t = 30_000)]
    pub heartbeat_timeout_ms: u64,

    /// Presence sweep interval in milliseconds (spec §4.3, at least every 5s).
    #[arg(long, env = "RELAY_SWEEP_INTERVAL_MS", default_value_t = 5_000)]
    pub sweep_interval_ms: u64,

    /// Dedup sliding-window width in milliseconds (spec §4.4 step 3, 60s).
    #[arg(long, env = "RELAY_DEDUP_WINDOW_MS", default_value_t = 60_000)]
    pub dedup_window_ms: u64,

    /// Soft backpressure watermark per outbound connection queue.
    #[arg(long, env = "RELAY_QUEUE_SOFT_LIMIT", default_value_t = 256)]
    pub queue_soft_limit: usize,

    /// Hard backpressure watermark; exceeding it closes the connection.
    #[arg(long, env = "RELAY_QUEUE_HARD_LIMIT", default_value_t = 1024)]
    pub queue_hard_limit: usize,

    /// Attachment retention in hours before the hourly sweep evicts them.
    #[arg(long, env = "RELAY_ATTACHMENT_RETENTION_HOURS", default_value_t = 24 * 7)]
    pub attachment_retention_hours: u64,

    /// Spawn rate limit: max respawns of the same name within the window.
    #[arg(long, env = "RELAY_SPAWN_RATE_LIMIT", default_value_t = 3)]
    pub spawn_rate_limit: u32,

    /// Spawn rate limit window in milliseconds (spec §4.10, 10s).
    #[arg(long, env = "RELAY_SPAWN_RATE_WINDOW_MS", default_value_t = 10_000)]
    pub spawn_rate_window_ms: u64,

    /// Log output format: `json` or `text`.
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level / `tracing-subscriber` env-filter directive.
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_soft_limit >= self.queue_hard_limit {
            anyhow::bail!("queue_soft_limit must be less than queue_hard_limit");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("log_format must be 'json' or 'text'");
        }
        Ok(())
    }

    /// Project-scoped data directory: `<data-dir>/<project-hash>`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        let root = self
            .data_dir
            .clone()
            .unwrap_or_else(default_data_root);
        root.join(project_hash(&self.project_dir))
    }

    /// Project-scoped Unix socket path under the resolved data directory.
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("relay.sock"))
    }
}

fn default_data_root() -> PathBuf {
    dirs_next_home().join(".local/share/agent-relay")
}

fn dirs_next_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Short, stable hash of the project path used to scope the socket and
/// data directory per spec.md §6.
fn project_hash(project_dir: &std::path::Path) -> String {
    use sha2::{Digest, Sha256};
    let canon = project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canon.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
