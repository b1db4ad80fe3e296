// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `relay-agent`: the CLI wrapper (C6-C9) that owns one multiplexer pane
//! per agent, parses its output, detects idle, injects deliveries, and
//! speaks the relay wire protocol to `relayd` over a Unix socket. Mirrors
//! the daemon's own `relay_daemon::{init_tracing, run}` shape so both
//! binaries start up the same way.

pub mod client;
pub mod config;
pub mod idle;
pub mod inbox;
pub mod injector;
pub mod pane;
pub mod parser;
pub mod time;
pub mod wrapper;

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::RelayClient;
use crate::config::Config;
use crate::pane::Pane;
use crate::wrapper::Wrapper;

/// Process exit codes (spec.md §6).
pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_ARGS: i32 = 64;
pub const EXIT_SPAWN_FAILURE: i32 = 69;
pub const EXIT_INTERNAL_ERROR: i32 = 70;

/// Installs the `tracing` subscriber per `--log-format`/`--log-level`,
/// identical in shape to `relay_daemon::init_tracing`.
pub fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Spawns the wrapped CLI in its own tmux pane, connects to the daemon,
/// and runs the poll loop until Ctrl-C. Returns the process exit code.
pub async fn run(config: Config) -> i32 {
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return EXIT_BAD_ARGS;
    }

    let env: HashMap<String, String> = std::env::vars().collect();
    let pane = match Pane::spawn(&config.session_name(), &config.cli, &config.cli_args(), &env, None).await {
        Ok(pane) => pane,
        Err(e) => {
            error!(error = %e, "failed to spawn multiplexer pane");
            return EXIT_SPAWN_FAILURE;
        }
    };

    let client = RelayClient::new(
        config.socket.clone(),
        config.name.clone(),
        config.cli.clone(),
        config.task.clone(),
        config.team.clone(),
    );
    let mut wrapper = Wrapper::new(
        pane,
        config.name.clone(),
        &config.cli,
        config.idle_threshold,
        config.inbox_path.clone(),
        client,
    );

    if let Err(e) = wrapper.start().await {
        error!(agent = %config.name, error = %e, "failed to connect to relay daemon");
        return EXIT_INTERNAL_ERROR;
    }
    info!(agent = %config.name, session = %config.session_name(), "agent wrapper running");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal_token.cancel();
    });

    wrapper.run(std::time::Duration::from_millis(config.poll_ms), shutdown).await;
    info!(agent = %config.name, "agent wrapper stopped");
    EXIT_OK
}
