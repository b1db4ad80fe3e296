// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle bookkeeping plus the per-agent log tail ring buffer
//! that backs `GET /api/logs/:name` and `/ws/logs/:name` (spec.md §6).
//! The ring buffer shape mirrors the teacher's `ring::RingBuffer` used for
//! terminal scrollback.

use std::collections::{HashMap, VecDeque};

use relay_proto::new_message_id;
use tokio::sync::{broadcast, RwLock};

use crate::store::Store;

const LOG_TAIL_CAPACITY: usize = 2_000;

pub struct SessionTracker {
    store: Store,
    logs: RwLock<HashMap<String, VecDeque<String>>>,
    log_feed: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl SessionTracker {
    pub fn new(store: Store) -> Self {
        SessionTracker {
            store,
            logs: RwLock::new(HashMap::new()),
            log_feed: RwLock::new(HashMap::new()),
        }
    }

    pub async fn open(&self, agent_name: &str, cli: &str, now_ms: u64) -> String {
        let id = new_message_id(now_ms);
        let _ = self
            .store
            .open_session(id.clone(), agent_name.to_string(), cli.to_string(), now_ms)
            .await;
        id
    }

    pub async fn end(&self, session_id: &str, summary: Option<String>, closed_by: &str, now_ms: u64) {
        let _ = self
            .store
            .end_session(session_id.to_string(), summary, closed_by.to_string(), now_ms)
            .await;
    }

    /// Appends a captured PTY/log line to an agent's tail buffer and fans
    /// it out to any live subscribers of `agent/<name>/logs`.
    pub async fn tail_log(&self, agent_name: &str, line: &str) {
        {
            let mut logs = self.logs.write().await;
            let buf = logs.entry(agent_name.to_string()).or_default();
            buf.push_back(line.to_string());
            while buf.len() > LOG_TAIL_CAPACITY {
                buf.pop_front();
            }
        }
        let feed = self.log_feed.read().await;
        if let Some(tx) = feed.get(agent_name) {
            let _ = tx.send(line.to_string());
        }
    }

    pub async fn tail(&self, agent_name: &str, n: usize) -> Vec<String> {
        let logs = self.logs.read().await;
        let Some(buf) = logs.get(agent_name) else {
            return Vec::new();
        };
        buf.iter().rev().take(n).rev().cloned().collect()
    }

    /// Subscribes to new log lines for `agent_name` as they arrive,
    /// backing the `/ws/logs/:name` gateway endpoint.
    pub async fn subscribe(&self, agent_name: &str) -> broadcast::Receiver<String> {
        let mut feed = self.log_feed.write().await;
        feed.entry(agent_name.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    pub async fn has_agent(&self, agent_name: &str) -> bool {
        self.logs.read().await.contains_key(agent_name)
            || self.log_feed.read().await.contains_key(agent_name)
    }
}

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;
