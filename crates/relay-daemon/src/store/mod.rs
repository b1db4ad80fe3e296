// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The embedded relational storage engine (C2). Schema and migration style
//! are grounded on a local chat daemon's `Db` (`Mutex<Connection>`, WAL
//! mode, idempotent `ALTER TABLE ... ADD COLUMN` migrations guarded with
//! `.ok()`), adapted for Tokio by running every call through
//! `spawn_blocking` so synchronous SQLite access never blocks the runtime.

mod schema;
#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

use std::path::Path;
use std::sync::Mutex;

use relay_proto::{DeliveryStatus, ErrorCode, Message, MessageKind};
use rusqlite::{params, Connection, OptionalExtension};

pub use schema::AgentSummary;

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub thread: Option<String>,
    pub since_ms: Option<u64>,
    pub search: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub agent_name: String,
    pub cli: String,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub summary: Option<String>,
    pub message_count: u32,
    pub closed_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentRow {
    pub name: String,
    pub cli: String,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub team: Option<String>,
}

/// A handle to the SQLite-backed store. Cheap to clone; the connection is
/// shared behind a mutex the same way the chat daemon's `Db` shares one.
#[derive(Clone)]
pub struct Store {
    inner: std::sync::Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, ErrorCode> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|_| ErrorCode::StorageUnavailable)?;
        }
        let conn = Connection::open(path).map_err(|_| ErrorCode::StorageCorrupt)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|_| ErrorCode::StorageCorrupt)?;
        schema::migrate(&conn).map_err(|_| ErrorCode::StorageCorrupt)?;
        Ok(Store {
            inner: std::sync::Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, ErrorCode> {
        let conn = Connection::open_in_memory().map_err(|_| ErrorCode::StorageCorrupt)?;
        schema::migrate(&conn).map_err(|_| ErrorCode::StorageCorrupt)?;
        Ok(Store {
            inner: std::sync::Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, ErrorCode>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let conn = inner.lock().map_err(|_| ErrorCode::StorageCorrupt)?;
            f(&conn).map_err(|_| ErrorCode::StorageUnavailable)
        })
        .await
        .map_err(|_| ErrorCode::StorageUnavailable)?
    }

    pub async fn append_message(&self, message: Message) -> Result<(), ErrorCode> {
        self.with_conn(move |conn| {
            let meta = serde_json::to_string(&message.meta).unwrap_or_default();
            let data = message.data.as_ref().map(|d| d.to_string());
            conn.execute(
                "INSERT INTO messages
                    (id, ts, from_name, to_name, body, kind, thread, channel, is_broadcast, status, data, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    message.id,
                    message.ts_ms as i64,
                    message.from,
                    message.to,
                    message.body,
                    kind_str(message.kind),
                    message.thread,
                    message.channel,
                    message.is_broadcast as i64,
                    status_str(message.status),
                    data,
                    meta,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_status(&self, id: String, status: DeliveryStatus) -> Result<(), ErrorCode> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE messages SET status = ?1 WHERE id = ?2",
                params![status_str(status), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_messages(&self, filter: MessageFilter) -> Result<Vec<Message>, ErrorCode> {
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT id, ts, from_name, to_name, body, kind, thread, channel, is_broadcast, status, data, meta
                 FROM messages WHERE 1=1",
            );
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(from) = &filter.from {
                sql.push_str(" AND from_name = ?");
                binds.push(Box::new(from.clone()));
            }
            if let Some(to) = &filter.to {
                sql.push_str(" AND to_name = ?");
                binds.push(Box::new(to.clone()));
            }
            if let Some(thread) = &filter.thread {
                sql.push_str(" AND thread = ?");
                binds.push(Box::new(thread.clone()));
            }
            if let Some(since) = filter.since_ms {
                sql.push_str(" AND ts >= ?");
                binds.push(Box::new(since as i64));
            }
            if let Some(search) = &filter.search {
                sql.push_str(" AND body LIKE ?");
                binds.push(Box::new(format!("%{search}%")));
            }
            sql.push_str(" ORDER BY ts DESC");
            if let Some(limit) = filter.limit {
                sql.push_str(" LIMIT ?");
                binds.push(Box::new(limit));
            }

            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params_ref.as_slice(), row_to_message)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn get_message_by_id(&self, id: String) -> Result<Option<Message>, ErrorCode> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, ts, from_name, to_name, body, kind, thread, channel, is_broadcast, status, data, meta
                 FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            )
            .optional()
        })
        .await
    }

    pub async fn open_session(&self, id: String, agent_name: String, cli: String, started_at_ms: u64) -> Result<(), ErrorCode> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, agent_name, cli, started_at, message_count) VALUES (?1, ?2, ?3, ?4, 0)",
                params![id, agent_name, cli, started_at_ms as i64],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn end_session(
        &self,
        id: String,
        summary: Option<String>,
        closed_by: String,
        ended_at_ms: u64,
    ) -> Result<(), ErrorCode> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET ended_at = ?1, summary = ?2, closed_by = ?3 WHERE id = ?4 AND ended_at IS NULL",
                params![ended_at_ms as i64, summary, closed_by, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn end_all_open_sessions(&self, closed_by: String, ended_at_ms: u64) -> Result<u64, ErrorCode> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE sessions SET ended_at = ?1, closed_by = ?2 WHERE ended_at IS NULL",
                params![ended_at_ms as i64, closed_by],
            )?;
            Ok(n as u64)
        })
        .await
    }

    pub async fn get_sessions(&self, agent_name: Option<String>, since_ms: Option<u64>) -> Result<Vec<Session>, ErrorCode> {
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT id, agent_name, cli, started_at, ended_at, summary, message_count, closed_by FROM sessions WHERE 1=1",
            );
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(name) = &agent_name {
                sql.push_str(" AND agent_name = ?");
                binds.push(Box::new(name.clone()));
            }
            if let Some(since) = since_ms {
                sql.push_str(" AND started_at >= ?");
                binds.push(Box::new(since as i64));
            }
            sql.push_str(" ORDER BY started_at DESC");
            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params_ref.as_slice(), |row| {
                Ok(Session {
                    id: row.get(0)?,
                    agent_name: row.get(1)?,
                    cli: row.get(2)?,
                    started_at_ms: row.get::<_, i64>(3)? as u64,
                    ended_at_ms: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                    summary: row.get(5)?,
                    message_count: row.get::<_, i64>(6)? as u32,
                    closed_by: row.get(7)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn upsert_agent(&self, row: AgentRow) -> Result<(), ErrorCode> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agents (name, cli, first_seen, last_seen, messages_sent, messages_received, team)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                    cli = excluded.cli,
                    last_seen = excluded.last_seen,
                    messages_sent = excluded.messages_sent,
                    messages_received = excluded.messages_received,
                    team = excluded.team",
                params![
                    row.name,
                    row.cli,
                    row.first_seen_ms as i64,
                    row.last_seen_ms as i64,
                    row.messages_sent as i64,
                    row.messages_received as i64,
                    row.team,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_summary(&self, summary: AgentSummary) -> Result<(), ErrorCode> {
        self.with_conn(move |conn| schema::upsert_summary(conn, &summary)).await
    }

    pub async fn get_summary(&self, agent_name: String) -> Result<Option<AgentSummary>, ErrorCode> {
        self.with_conn(move |conn| schema::get_summary(conn, &agent_name)).await
    }
}

fn kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Message => "message",
        MessageKind::System => "system",
        MessageKind::Log => "log",
        MessageKind::Action => "action",
    }
}

fn status_str(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Acked => "acked",
        DeliveryStatus::Failed => "failed",
    }
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let kind: String = row.get(5)?;
    let status: String = row.get(9)?;
    let data: Option<String> = row.get(10)?;
    let meta: Option<String> = row.get(11)?;
    Ok(Message {
        id: row.get(0)?,
        ts_ms: row.get::<_, i64>(1)? as u64,
        from: row.get(2)?,
        to: row.get(3)?,
        body: row.get(4)?,
        kind: match kind.as_str() {
            "system" => MessageKind::System,
            "log" => MessageKind::Log,
            "action" => MessageKind::Action,
            _ => MessageKind::Message,
        },
        thread: row.get(6)?,
        channel: row.get(7)?,
        is_broadcast: row.get::<_, i64>(8)? != 0,
        meta: meta
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_default(),
        data: data.and_then(|d| serde_json::from_str(&d).ok()),
        status: match status.as_str() {
            "delivered" => DeliveryStatus::Delivered,
            "acked" => DeliveryStatus::Acked,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        },
    })
}
