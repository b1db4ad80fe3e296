// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Table definitions and idempotent migrations for the four tables in
//! `SPEC_FULL.md` §4.2, in the style of the pack's local chat daemon
//! (`CREATE TABLE IF NOT EXISTS` plus `.ok()`-guarded `ALTER TABLE ... ADD
//! COLUMN` for additive schema changes).

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            ts INTEGER NOT NULL,
            from_name TEXT NOT NULL,
            to_name TEXT NOT NULL,
            body TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'message',
            thread TEXT,
            channel TEXT,
            is_broadcast INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            data TEXT,
            meta TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_to_ts ON messages(to_name, ts DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_from_ts ON messages(from_name, ts DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_thread_ts ON messages(thread, ts);

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            agent_name TEXT NOT NULL,
            cli TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            summary TEXT,
            message_count INTEGER NOT NULL DEFAULT 0,
            closed_by TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_agent_started
            ON sessions(agent_name, started_at DESC);

        CREATE TABLE IF NOT EXISTS agent_summaries (
            agent_name TEXT PRIMARY KEY,
            project_id TEXT,
            last_updated INTEGER NOT NULL,
            current_task TEXT,
            completed_tasks TEXT,
            decisions TEXT,
            context TEXT,
            files TEXT
        );

        CREATE TABLE IF NOT EXISTS agents (
            name TEXT PRIMARY KEY,
            cli TEXT NOT NULL,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            messages_sent INTEGER NOT NULL DEFAULT 0,
            messages_received INTEGER NOT NULL DEFAULT 0,
            team TEXT
        );",
    )?;

    // Additive columns from later revisions; ignored if already present.
    conn.execute_batch("ALTER TABLE messages ADD COLUMN is_urgent INTEGER DEFAULT 0;")
        .ok();

    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_name: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub last_updated_ms: u64,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

pub fn upsert_summary(conn: &Connection, summary: &AgentSummary) -> rusqlite::Result<()> {
    let completed = serde_json::to_string(&summary.completed_tasks).unwrap_or_default();
    let decisions = serde_json::to_string(&summary.decisions).unwrap_or_default();
    let files = serde_json::to_string(&summary.files).unwrap_or_default();
    conn.execute(
        "INSERT INTO agent_summaries
            (agent_name, project_id, last_updated, current_task, completed_tasks, decisions, context, files)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(agent_name) DO UPDATE SET
            project_id = excluded.project_id,
            last_updated = excluded.last_updated,
            current_task = excluded.current_task,
            completed_tasks = excluded.completed_tasks,
            decisions = excluded.decisions,
            context = excluded.context,
            files = excluded.files",
        params![
            summary.agent_name,
            summary.project_id,
            summary.last_updated_ms as i64,
            summary.current_task,
            completed,
            decisions,
            summary.context,
            files,
        ],
    )?;
    Ok(())
}

pub fn get_summary(conn: &Connection, agent_name: &str) -> rusqlite::Result<Option<AgentSummary>> {
    conn.query_row(
        "SELECT agent_name, project_id, last_updated, current_task, completed_tasks, decisions, context, files
         FROM agent_summaries WHERE agent_name = ?1",
        params![agent_name],
        |row| {
            let completed: Option<String> = row.get(4)?;
            let decisions: Option<String> = row.get(5)?;
            let files: Option<String> = row.get(7)?;
            Ok(AgentSummary {
                agent_name: row.get(0)?,
                project_id: row.get(1)?,
                last_updated_ms: row.get::<_, i64>(2)? as u64,
                current_task: row.get(3)?,
                completed_tasks: completed
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
                decisions: decisions
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
                context: row.get(6)?,
                files: files
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
            })
        },
    )
    .optional()
}
