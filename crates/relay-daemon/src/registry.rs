// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory agent presence table (C3), generalized from the teacher's
//! `PodRegistry`: a single `RwLock<HashMap<..>>` with short critical
//! sections, derived index sets rebuilt on every mutation, and a
//! background sweep task that ages out stale entries.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// `name → AgentRecord`, 1-64 chars, `[A-Za-z0-9_\-.]`; `*` reserved for
/// broadcast, names prefixed `__` reserved for internal use.
pub fn is_valid_agent_name(name: &str) -> bool {
    if name == "*" {
        return false;
    }
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub cli: String,
    pub task: Option<String>,
    pub team: Option<String>,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub last_heartbeat_ms: u64,
    pub state: ConnState,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Current session id, if one is open for this agent.
    pub session_id: Option<String>,
}

/// Outcome of a `HELLO`: the freshly (re)created record, plus a reason to
/// close the *old* connection of the same name if one was live
/// (spec.md §3 "a new HELLO ... atomically replaces the old connection").
pub struct HelloOutcome {
    pub record: AgentRecord,
    pub superseded: bool,
}

pub struct Registry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    by_team: RwLock<HashMap<String, HashSet<String>>>,
    presence_path: Option<PathBuf>,
}

impl Registry {
    pub fn new(presence_path: Option<PathBuf>) -> Self {
        Registry {
            agents: RwLock::new(HashMap::new()),
            by_team: RwLock::new(HashMap::new()),
            presence_path,
        }
    }

    /// Registers (or replaces) the live record for `name`. Returns whether
    /// an existing connected record for the same name was superseded.
    pub async fn hello(
        &self,
        name: &str,
        cli: &str,
        task: Option<String>,
        team: Option<String>,
        now_ms: u64,
    ) -> HelloOutcome {
        let mut agents = self.agents.write().await;
        let superseded = agents
            .get(name)
            .is_some_and(|r| matches!(r.state, ConnState::Connected));

        let first_seen_ms = agents.get(name).map(|r| r.first_seen_ms).unwrap_or(now_ms);
        let record = AgentRecord {
            name: name.to_string(),
            cli: cli.to_string(),
            task,
            team: team.clone(),
            first_seen_ms,
            last_seen_ms: now_ms,
            last_heartbeat_ms: now_ms,
            state: ConnState::Connected,
            messages_sent: agents.get(name).map(|r| r.messages_sent).unwrap_or(0),
            messages_received: agents.get(name).map(|r| r.messages_received).unwrap_or(0),
            session_id: None,
        };
        agents.insert(name.to_string(), record.clone());
        drop(agents);

        if let Some(team) = team {
            self.by_team
                .write()
                .await
                .entry(team)
                .or_default()
                .insert(name.to_string());
        }
        self.persist().await;
        HelloOutcome { record, superseded }
    }

    pub async fn set_session(&self, name: &str, session_id: Option<String>) {
        if let Some(rec) = self.agents.write().await.get_mut(name) {
            rec.session_id = session_id;
        }
    }

    /// Refresh `last_seen` from any frame; refresh `last_heartbeat` only
    /// for an explicit heartbeat or the frame types spec.md treats as
    /// liveness-bearing (any frame at all, per §4.3).
    pub async fn touch(&self, name: &str, now_ms: u64) {
        if let Some(rec) = self.agents.write().await.get_mut(name) {
            rec.last_seen_ms = now_ms;
            rec.last_heartbeat_ms = now_ms;
        }
    }

    pub async fn record_sent(&self, name: &str) {
        if let Some(rec) = self.agents.write().await.get_mut(name) {
            rec.messages_sent += 1;
        }
    }

    pub async fn record_received(&self, name: &str) {
        if let Some(rec) = self.agents.write().await.get_mut(name) {
            rec.messages_received += 1;
        }
    }

    pub async fn get(&self, name: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(name).cloned()
    }

    pub async fn is_online(&self, name: &str) -> bool {
        self.get(name)
            .await
            .is_some_and(|r| matches!(r.state, ConnState::Connected))
    }

    /// Online members of `team`, used by the router's `team:<name>`
    /// recipient expansion (spec.md §4.4 step 2).
    pub async fn online_team_members(&self, team: &str) -> Vec<String> {
        let by_team = self.by_team.read().await;
        let Some(members) = by_team.get(team) else {
            return Vec::new();
        };
        let agents = self.agents.read().await;
        members
            .iter()
            .filter(|name| {
                agents
                    .get(*name)
                    .is_some_and(|r| matches!(r.state, ConnState::Connected))
            })
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Marks `name` disconnected (connection loss, explicit `BYE`, or
    /// sweep eviction). Idempotent. Returns the session id that was open,
    /// if any, so the caller can end it in storage.
    pub async fn disconnect(&self, name: &str, now_ms: u64) -> Option<String> {
        let mut agents = self.agents.write().await;
        let rec = agents.get_mut(name)?;
        rec.state = ConnState::Disconnected;
        rec.last_seen_ms = now_ms;
        let session_id = rec.session_id.take();
        drop(agents);
        self.persist().await;
        session_id
    }

    /// Heartbeat sweep (spec.md §4.3): transitions any record whose last
    /// heartbeat is older than `timeout_ms` to disconnected. Returns the
    /// `(name, session_id)` pairs that were transitioned, so the caller
    /// can end their sessions with `closedBy = "disconnect"`.
    pub async fn sweep(&self, now_ms: u64, timeout_ms: u64) -> Vec<(String, Option<String>)> {
        let mut stale = Vec::new();
        {
            let mut agents = self.agents.write().await;
            for rec in agents.values_mut() {
                if matches!(rec.state, ConnState::Connected)
                    && now_ms.saturating_sub(rec.last_heartbeat_ms) > timeout_ms
                {
                    rec.state = ConnState::Disconnected;
                    stale.push((rec.name.clone(), rec.session_id.take()));
                }
            }
        }
        if !stale.is_empty() {
            self.persist().await;
        }
        stale
    }

    /// Serializes current presence to `team/agents.json` (spec.md §6),
    /// atomically (temp-file + rename), so external readers can observe
    /// presence without talking to the daemon.
    async fn persist(&self) {
        let Some(path) = &self.presence_path else {
            return;
        };
        let snapshot = self.snapshot().await;
        let Ok(json) = serde_json::to_string_pretty(&snapshot) else {
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

    pub fn presence_path(&self) -> Option<&Path> {
        self.presence_path.as_deref()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
