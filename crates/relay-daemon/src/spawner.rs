// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Spawner (C10): lifecycle of wrapped `relay-agent` child processes.
//! Pool bookkeeping is generalized directly from the teacher's
//! `MuxState.sessions: RwLock<HashMap<String, Arc<SessionEntry>>>` plus
//! `spawn_health_checker`'s "snapshot, iterate, evict" shape
//! (`upstream/health.rs`) — here spawning local children
//! (`tokio::process::Command`) instead of dialing remote pods over HTTP.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_proto::ErrorCode;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::sessions::SessionTracker;
use crate::time::now_ms;

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerInfo {
    pub name: String,
    pub cli: String,
    pub task: Option<String>,
    pub team: Option<String>,
    pub pid: Option<u32>,
    pub spawned_at_ms: u64,
}

/// Emitted when a worker exits on its own (the spawner never auto-restarts
/// — spec.md §4.10 leaves that decision to the dashboard/coordinator).
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerExited {
    pub name: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
}

struct WorkerHandle {
    info: WorkerInfo,
    cancel: CancellationToken,
}

pub struct Spawner {
    workers: RwLock<HashMap<String, WorkerHandle>>,
    respawn_times: Mutex<HashMap<String, VecDeque<Instant>>>,
    sessions: Arc<SessionTracker>,
    events: broadcast::Sender<WorkerExited>,
    agent_bin: PathBuf,
    socket_path: PathBuf,
    rate_limit: u32,
    rate_window: Duration,
    state_path: Option<PathBuf>,
}

/// Serialized shape of `team/processing-state.json` (spec.md §6): the live
/// worker pool plus recent respawn counts, written atomically on every
/// transition, mirroring `registry::Registry::persist`.
#[derive(serde::Serialize)]
struct ProcessingStateSnapshot {
    workers: Vec<WorkerInfo>,
    recent_respawns: HashMap<String, usize>,
}

impl Spawner {
    pub fn new(
        sessions: Arc<SessionTracker>,
        agent_bin: PathBuf,
        socket_path: PathBuf,
        rate_limit: u32,
        rate_window: Duration,
    ) -> Arc<Self> {
        Self::with_state_path(sessions, agent_bin, socket_path, rate_limit, rate_window, None)
    }

    pub fn with_state_path(
        sessions: Arc<SessionTracker>,
        agent_bin: PathBuf,
        socket_path: PathBuf,
        rate_limit: u32,
        rate_window: Duration,
        state_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Spawner {
            workers: RwLock::new(HashMap::new()),
            respawn_times: Mutex::new(HashMap::new()),
            sessions,
            events,
            agent_bin,
            socket_path,
            rate_limit,
            rate_window,
            state_path,
        })
    }

    /// Writes `team/processing-state.json` atomically (temp-file + rename).
    async fn persist_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let workers: Vec<WorkerInfo> = self.workers.read().await.values().map(|h| h.info.clone()).collect();
        let recent_respawns = self
            .respawn_times
            .lock()
            .await
            .iter()
            .map(|(name, times)| (name.clone(), times.len()))
            .collect();
        let snapshot = ProcessingStateSnapshot { workers, recent_respawns };
        write_atomic_json(path, &snapshot);
    }

    pub fn subscribe_exits(&self) -> broadcast::Receiver<WorkerExited> {
        self.events.subscribe()
    }

    pub async fn spawn(
        self: &Arc<Self>,
        name: String,
        cli: String,
        task: Option<String>,
        team: Option<String>,
        env_overrides: HashMap<String, String>,
    ) -> Result<WorkerInfo, ErrorCode> {
        if self.workers.read().await.contains_key(&name) {
            return Err(ErrorCode::NameInUse);
        }
        if self.rate_limited(&name).await {
            return Err(ErrorCode::SpawnRateLimited);
        }

        let mut cmd = Command::new(&self.agent_bin);
        cmd.env("RELAY_AGENT_NAME", &name)
            .env("RELAY_AGENT_CLI", &cli)
            .env("RELAY_SOCKET", &self.socket_path);
        if let Some(task) = &task {
            cmd.env("RELAY_AGENT_TASK", task);
        }
        if let Some(team) = &team {
            cmd.env("RELAY_AGENT_TEAM", team);
        }
        for (k, v) in &env_overrides {
            cmd.env(k, v);
        }
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            warn!(agent = %name, error = %e, "failed to spawn relay-agent child");
            ErrorCode::MultiplexerMissing
        })?;

        let pid = child.id();
        let spawned_at_ms = now_ms();
        let cancel = CancellationToken::new();
        let info = WorkerInfo {
            name: name.clone(),
            cli,
            task,
            team,
            pid,
            spawned_at_ms,
        };

        self.workers.write().await.insert(
            name.clone(),
            WorkerHandle { info: info.clone(), cancel: cancel.clone() },
        );

        self.spawn_completion_watcher(name, child, cancel, spawned_at_ms);
        self.persist_state().await;
        Ok(info)
    }

    fn spawn_completion_watcher(
        self: &Arc<Self>,
        name: String,
        mut child: Child,
        cancel: CancellationToken,
        spawned_at_ms: u64,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    None
                }
            };
            let was_released = cancel.is_cancelled();
            this.workers.write().await.remove(&name);
            this.persist_state().await;
            if was_released {
                return;
            }
            let elapsed_ms = now_ms().saturating_sub(spawned_at_ms);
            let exit_code = status.and_then(|s| s.code());
            info!(agent = %name, exit_code, elapsed_ms, "relay-agent worker exited");
            let _ = this.events.send(WorkerExited { name, exit_code, elapsed_ms });
        });
    }

    /// Back-off: refuses a spawn when the same name has been (re)spawned
    /// `rate_limit` or more times within `rate_window` (spec.md §4.10).
    async fn rate_limited(&self, name: &str) -> bool {
        let now = Instant::now();
        let mut times = self.respawn_times.lock().await;
        let window = times.entry(name.to_string()).or_default();
        window.retain(|t| now.duration_since(*t) < self.rate_window);
        window.push_back(now);
        window.len() as u32 > self.rate_limit
    }

    /// Stops and removes a worker. Idempotent — releasing an unknown or
    /// already-released name is a no-op success.
    pub async fn release(&self, name: &str) {
        let handle = self.workers.write().await.remove(name);
        if let Some(handle) = handle {
            handle.cancel.cancel();
        }
    }

    pub async fn list(&self) -> Vec<WorkerInfo> {
        self.workers
            .read()
            .await
            .values()
            .map(|h| h.info.clone())
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<WorkerInfo> {
        self.workers.read().await.get(name).map(|h| h.info.clone())
    }

    pub async fn output(&self, name: &str, tail: usize) -> Vec<String> {
        self.sessions.tail(name, tail).await
    }
}

/// Atomic temp-file-then-rename writer, matching `registry::Registry::persist`
/// and `router`'s own copy — small enough that sharing it isn't worth a
/// fourth module.
fn write_atomic_json<T: serde::Serialize>(path: &Path, value: &T) {
    let Ok(json) = serde_json::to_string_pretty(value) else {
        return;
    };
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let tmp = path.with_extension("json.tmp");
    if std::fs::write(&tmp, json).is_ok() {
        let _ = std::fs::rename(&tmp, path);
    }
}

#[cfg(test)]
#[path = "spawner_tests.rs"]
mod tests;
