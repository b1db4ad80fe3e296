// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Injector (C8): delivers a message into an agent's pane as if a human
//! had typed it, without destroying concurrent keystrokes or interleaving
//! with agent output (spec.md §4.8 — "hardest algorithm"). Grounded on the
//! teacher's `driver::nudge::SafeNudgeEncoder` (typed delay, write-then-
//! wait-then-Enter) and the `transport::spawn_enter_retry` shape (a
//! cancellable, exponentially-backed-off verify/retry loop).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::inbox;
use crate::pane::PaneOps;

/// Consecutive polls the cursor must sit at column ≤4 to count as "clear".
const STABLE_CURSOR_THRESHOLD: u32 = 3;
const STABLE_CURSOR_MAX_COLUMN: u16 = 4;
const CLEAR_INPUT_TIMEOUT: Duration = Duration::from_secs(5);
const STABLE_PANE_BUDGET: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const ENTER_DELAY: Duration = Duration::from_millis(100);
const VERIFY_TAIL_BYTES: usize = 4096;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(300);

/// Per-CLI behavioral knobs the injector needs to avoid sending keystrokes
/// to the wrong kind of prompt (spec.md §4.8 step 4).
#[derive(Debug, Clone)]
pub struct CliProfile {
    /// Matches the agent's own chat/REPL prompt (e.g. `> `).
    pub chat_prompt: Regex,
    /// Matches a bare shell prompt (`$`, `%`, `#`) the injector must never
    /// type into.
    pub shell_prompt: Regex,
    /// Whether the body should be wrapped in backticks before injection,
    /// for CLIs that interpret shell metacharacters in raw input.
    pub wrap_in_backticks: bool,
}

impl CliProfile {
    /// A conservative default profile for an unrecognized CLI.
    // Every pattern below is a compile-time constant; `expect` here
    // reports a programming error, not a runtime failure mode.
    #[allow(clippy::expect_used)]
    pub fn generic() -> Self {
        Self {
            chat_prompt: Regex::new(r"^\s*>\s*$").expect("valid regex"),
            shell_prompt: Regex::new(r"[$%#]\s*$").expect("valid regex"),
            wrap_in_backticks: false,
        }
    }

    /// Profile lookup by the agent's declared `cli` name (spec.md §4.9:
    /// "Set session options" / C8 step 4 "CLI-specific guard"). Falls
    /// back to [`CliProfile::generic`] for anything unrecognized.
    #[allow(clippy::expect_used)]
    pub fn for_cli(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => Self {
                chat_prompt: Regex::new(r"^\s*>\s*$").expect("valid regex"),
                shell_prompt: Regex::new(r"[$%#]\s*$").expect("valid regex"),
                wrap_in_backticks: false,
            },
            "codex" => Self {
                chat_prompt: Regex::new(r"^\s*›\s*$|^\s*>\s*$").expect("valid regex"),
                shell_prompt: Regex::new(r"[$%#]\s*$").expect("valid regex"),
                wrap_in_backticks: true,
            },
            "gemini" | "gemini-cli" => Self {
                chat_prompt: Regex::new(r"^\s*>\s*$|^\s*\?\s*$").expect("valid regex"),
                shell_prompt: Regex::new(r"[$%#]\s*$").expect("valid regex"),
                wrap_in_backticks: false,
            },
            _ => Self::generic(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub from: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionOutcome {
    Delivered,
    Requeued,
    FellBackToInbox,
}

/// Single-threaded, per-agent delivery queue into one pane.
pub struct Injector {
    queue: VecDeque<PendingMessage>,
    profile: CliProfile,
    inbox_path: Option<PathBuf>,
    busy: bool,
    pub delivery_failures: u64,
}

impl Injector {
    pub fn new(profile: CliProfile, inbox_path: Option<PathBuf>) -> Self {
        Self { queue: VecDeque::new(), profile, inbox_path, busy: false, delivery_failures: 0 }
    }

    pub fn enqueue(&mut self, from: String, body: String) {
        self.queue.push_back(PendingMessage { from, body });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Attempts to deliver the head of the queue. A no-op (returns `None`)
    /// if a delivery is already in flight or the queue is empty (spec.md
    /// §4.8 step 1).
    pub async fn tick(&mut self, pane: &dyn PaneOps, now_ms: u64) -> Option<InjectionOutcome> {
        if self.busy {
            return None;
        }
        let msg = self.queue.pop_front()?;
        self.busy = true;
        let outcome = self.deliver(pane, &msg, now_ms).await;
        self.busy = false;
        if outcome == InjectionOutcome::Requeued {
            self.queue.push_front(msg);
        }
        Some(outcome)
    }

    async fn deliver(&mut self, pane: &dyn PaneOps, msg: &PendingMessage, now_ms: u64) -> InjectionOutcome {
        if !wait_for_clear_input(pane, &self.profile).await {
            return InjectionOutcome::Requeued;
        }
        if !wait_for_stable_pane(pane).await {
            return InjectionOutcome::Requeued;
        }
        if at_shell_prompt(pane, &self.profile).await {
            return InjectionOutcome::Requeued;
        }

        let cursor_before = pane.cursor_column().await;
        let line = build_injection_line(msg, &self.profile);

        for attempt in 0..MAX_ATTEMPTS {
            write_and_enter(pane, &line).await;
            let wait = RETRY_BASE * 2u32.pow(attempt);
            tokio::time::sleep(wait).await;
            if verify_delivered(pane, &line, cursor_before).await {
                return InjectionOutcome::Delivered;
            }
        }

        self.delivery_failures += 1;
        if let Some(path) = &self.inbox_path {
            let _ = inbox::append(path, &msg.from, &msg.body, now_ms);
        }
        InjectionOutcome::FellBackToInbox
    }
}

async fn wait_for_clear_input(pane: &dyn PaneOps, profile: &CliProfile) -> bool {
    let deadline = Instant::now() + CLEAR_INPUT_TIMEOUT;
    let mut stable_polls = 0u32;
    loop {
        let Ok(text) = pane.capture().await else { return false };
        let last_line = text.lines().last().unwrap_or("");
        if profile.chat_prompt.is_match(last_line) {
            return true;
        }
        match pane.cursor_column().await {
            Some(col) if col <= STABLE_CURSOR_MAX_COLUMN => {
                stable_polls += 1;
                if stable_polls >= STABLE_CURSOR_THRESHOLD {
                    return true;
                }
            }
            _ => stable_polls = 0,
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_stable_pane(pane: &dyn PaneOps) -> bool {
    let deadline = Instant::now() + STABLE_PANE_BUDGET;
    let mut last_hash: Option<String> = None;
    loop {
        let Ok(text) = pane.capture().await else { return false };
        let hash = fingerprint(&text);
        if last_hash.as_deref() == Some(hash.as_str()) {
            return true;
        }
        last_hash = Some(hash);
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn at_shell_prompt(pane: &dyn PaneOps, profile: &CliProfile) -> bool {
    let Ok(text) = pane.capture().await else { return false };
    let last_line = text.lines().last().unwrap_or("");
    profile.shell_prompt.is_match(last_line) && !profile.chat_prompt.is_match(last_line)
}

fn build_injection_line(msg: &PendingMessage, profile: &CliProfile) -> String {
    let collapsed = msg.body.replace('\n', " ");
    let body = if profile.wrap_in_backticks { format!("`{collapsed}`") } else { collapsed };
    format!("[from={}] {}", msg.from, body)
}

async fn write_and_enter(pane: &dyn PaneOps, line: &str) {
    let _ = pane.send_literal(line).await;
    tokio::time::sleep(ENTER_DELAY).await;
    let _ = pane.send_enter().await;
}

async fn verify_delivered(pane: &dyn PaneOps, line: &str, cursor_before: Option<u16>) -> bool {
    let Ok(text) = pane.capture().await else { return false };
    let floor = text.len().saturating_sub(VERIFY_TAIL_BYTES);
    let start = (floor..=text.len()).find(|&i| text.is_char_boundary(i)).unwrap_or(text.len());
    let tail = &text[start..];
    if !tail.contains(line) {
        return false;
    }
    match (cursor_before, pane.cursor_column().await) {
        (Some(before), Some(after)) => after != before,
        _ => true,
    }
}

fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
#[path = "injector_tests.rs"]
mod tests;
