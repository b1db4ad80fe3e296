// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `relayd`: the Agent Relay coordination daemon. `run` wires together the
//! storage engine (C2), presence registry (C3), router (C4), per-connection
//! tasks (C5), spawner (C10), and dashboard gateway (C11), generalized from
//! the teacher's `coop_mux::run` (`crates/mux/src/lib.rs`) — bind, spawn the
//! background tasks, serve until a cancellation token fires, then drain.

pub mod config;
pub mod connection;
pub mod gateway;
pub mod registry;
pub mod router;
pub mod sessions;
pub mod spawner;
pub mod store;
pub mod time;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_proto::ErrorCode;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connection::run_connection;
use crate::gateway::GatewayState;
use crate::registry::Registry;
use crate::router::Router;
use crate::sessions::SessionTracker;
use crate::spawner::Spawner;
use crate::store::Store;
use crate::time::now_ms;

/// Process exit codes (spec.md §6).
pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_ARGS: i32 = 64;
pub const EXIT_BIND_FAILURE: i32 = 69;
pub const EXIT_INTERNAL_ERROR: i32 = 70;

/// Installs the `tracing` subscriber per `--log-format`/`--log-level`.
pub fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Runs the daemon until Ctrl-C or a fatal startup error. Returns the
/// process exit code to use (spec.md §6: 0 clean, 64 bad args, 69
/// socket-bind failure, 70 internal error).
pub async fn run(config: Config) -> i32 {
    if let Err(e) = config.validate() {
        eprintln!("error: {e:#}");
        return EXIT_BAD_ARGS;
    }

    let data_dir = config.resolved_data_dir();
    let socket_path = config.resolved_socket_path();

    let store = match setup_store(&data_dir) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "fatal: could not open storage engine");
            return EXIT_INTERNAL_ERROR;
        }
    };

    // Crash recovery: sessions still open from a prior run were never
    // closed cleanly.
    let recovered = store
        .end_all_open_sessions("error".to_string(), now_ms())
        .await
        .unwrap_or(0);
    if recovered > 0 {
        warn!(recovered, "ended stale open sessions from a previous run");
    }

    let presence_path = data_dir.join("team").join("agents.json");
    let registry = Arc::new(Registry::new(Some(presence_path)));
    let router = Router::new(
        store.clone(),
        registry.clone(),
        Duration::from_millis(config.dedup_window_ms),
        config.queue_soft_limit,
        config.queue_hard_limit,
        Some(data_dir.join("team").join("bridge-state.json")),
    );
    let sessions = Arc::new(SessionTracker::new(store.clone()));
    let agent_bin = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.join("relay-agent")))
        .unwrap_or_else(|| PathBuf::from("relay-agent"));
    let spawner = Spawner::with_state_path(
        sessions.clone(),
        agent_bin,
        socket_path.clone(),
        config.spawn_rate_limit,
        Duration::from_millis(config.spawn_rate_window_ms),
        Some(data_dir.join("team").join("processing-state.json")),
    );

    let listener = match bind_socket(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            error!(path = %socket_path.display(), error = %e, "failed to bind relay socket");
            return EXIT_BIND_FAILURE;
        }
    };

    let attachments_dir = data_dir.join("attachments");
    let gateway_state = Arc::new(GatewayState {
        store: store.clone(),
        registry: registry.clone(),
        router: router.clone(),
        sessions: sessions.clone(),
        spawner: spawner.clone(),
        auth_token: config.auth_token.clone(),
        attachments_dir: attachments_dir.clone(),
    });
    let gateway_router = gateway::build_router(gateway_state);
    let http_listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.http_addr, error = %e, "failed to bind dashboard gateway");
            return EXIT_BIND_FAILURE;
        }
    };

    let shutdown = CancellationToken::new();

    let accept_task = tokio::spawn(accept_loop(
        listener,
        router.clone(),
        sessions.clone(),
        shutdown.clone(),
    ));

    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, gateway_router)
            .with_graceful_shutdown(http_shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "dashboard gateway server error");
        }
    });

    let sweep_task = spawn_heartbeat_sweeper(
        registry.clone(),
        sessions.clone(),
        router.clone(),
        config.heartbeat_timeout_ms,
        config.sweep_interval_ms,
        shutdown.clone(),
    );
    let eviction_task =
        spawn_attachment_eviction(attachments_dir, config.attachment_retention_hours, shutdown.clone());

    info!(socket = %socket_path.display(), http = %config.http_addr, "relayd ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    let _ = accept_task.await;
    let _ = http_task.await;
    sweep_task.abort();
    eviction_task.abort();
    let _ = store.end_all_open_sessions("error".to_string(), now_ms()).await;

    EXIT_OK
}

fn setup_store(data_dir: &Path) -> Result<Store, ErrorCode> {
    std::fs::create_dir_all(data_dir).map_err(|_| ErrorCode::StorageUnavailable)?;
    Store::open(&data_dir.join("store.db"))
}

/// Binds the Unix socket, clearing a stale path from a prior crashed run
/// and restricting permissions to 0600 (spec.md §6).
fn bind_socket(path: &Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

async fn accept_loop(
    listener: UnixListener,
    router: Arc<Router>,
    sessions: Arc<SessionTracker>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let router = router.clone();
                        let sessions = sessions.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            run_connection(stream, router, sessions, conn_shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

/// Periodically sweeps stale heartbeats (spec.md §4.3), ending any lingering
/// session as `closedBy=disconnect`.
fn spawn_heartbeat_sweeper(
    registry: Arc<Registry>,
    sessions: Arc<SessionTracker>,
    router: Arc<Router>,
    timeout_ms: u64,
    interval_ms: u64,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let stale = registry.sweep(now_ms(), timeout_ms).await;
                    for (name, session_id) in stale {
                        if let Some(session_id) = session_id {
                            sessions.end(&session_id, None, "disconnect", now_ms()).await;
                        }
                        router.publish("presence", serde_json::json!({"agent": name, "state": "disconnected"})).await;
                    }
                }
            }
        }
    })
}

/// Hourly attachment retention sweep (spec.md §6).
fn spawn_attachment_eviction(
    dir: PathBuf,
    retention_hours: u64,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    gateway::evict_stale_attachments(&dir, retention_hours).await;
                }
            }
        }
    })
}
