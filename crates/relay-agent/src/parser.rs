// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Output parser (C6): extracts `->relay:` commands and `[[SUMMARY]]` /
//! `[[SESSION_END]]` blocks from a captured pane buffer (spec.md §4.6).
//!
//! The pane is re-captured on every poll, so the same text is fed to
//! [`Parser::feed`] many times over. Every emission is identified by a
//! content hash of its raw matched text and returned at most once.

use std::collections::VecDeque;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Bound on how many content hashes the parser remembers before it starts
/// evicting the oldest. A pane's scrollback is finite, so this never needs
/// to track more than a session's worth of distinct emissions.
const SEEN_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    All,
    Team(String),
    Channel(String),
    Agent(String),
    Spawn,
    Release,
    Continuity(String),
}

impl Recipient {
    fn parse(raw: &str) -> Self {
        if raw == "*" {
            Recipient::All
        } else if let Some(rest) = raw.strip_prefix("team:") {
            Recipient::Team(rest.to_string())
        } else if let Some(rest) = raw.strip_prefix('#') {
            Recipient::Channel(rest.to_string())
        } else if raw == "spawn" {
            Recipient::Spawn
        } else if raw == "release" {
            Recipient::Release
        } else if let Some(rest) = raw.strip_prefix("continuity:") {
            Recipient::Continuity(rest.to_string())
        } else {
            Recipient::Agent(raw.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMeta {
    pub importance: Option<u8>,
    pub reply_to: Option<String>,
    pub ack: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayCommand {
    pub recipient: Recipient,
    pub body: String,
    pub meta: ParsedMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryBlock {
    #[serde(rename = "currentTask", default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(rename = "completedTasks", default)]
    pub completed_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SessionEndBlock {
    pub summary: String,
    #[serde(rename = "completedTasks", default)]
    pub completed_tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Relay(RelayCommand),
    Summary(SummaryBlock),
    SessionEnd(SessionEndBlock),
    MalformedSummary { raw: String, error: String },
    MalformedSessionEnd { raw: String, error: String },
}

// Compile-time-constant patterns; a failure here is a programming error
// that any test touching the parser would catch immediately.
#[allow(clippy::expect_used)]
static SINGLE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^->relay:(\S+)\s(.*)$").expect("valid regex"));
#[allow(clippy::expect_used)]
static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^->relay:(\S+)\s*<<<\s*(.*)$").expect("valid regex"));
#[allow(clippy::expect_used)]
static META_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\[(importance=(\d)|replyTo=([^\]]+)|ack)\]\s*$").expect("valid regex")
});
#[allow(clippy::expect_used)]
static SUMMARY_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[\[SUMMARY\]\](.*?)\[\[/SUMMARY\]\]").expect("valid regex")
});
#[allow(clippy::expect_used)]
static SESSION_END_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[\[SESSION_END\]\](.*?)\[\[/SESSION_END\]\]").expect("valid regex")
});

/// Incremental, idempotent extractor of embedded relay commands and
/// structured blocks from a repeatedly re-captured pane buffer.
pub struct Parser {
    seen: VecDeque<String>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self { seen: VecDeque::with_capacity(SEEN_CAPACITY) }
    }

    /// Feed the full current pane text (ANSI already stripped, wrapped
    /// lines already rejoined) and return every not-yet-seen emission.
    pub fn feed(&mut self, text: &str) -> Vec<Emission> {
        let mut out = Vec::new();
        self.scan_relay_commands(text, &mut out);
        self.scan_blocks(text, &SUMMARY_BLOCK, &mut out, |raw| match parse_summary(raw) {
            Ok(summary) => Emission::Summary(summary),
            Err(error) => Emission::MalformedSummary { raw: raw.to_string(), error },
        });
        self.scan_blocks(text, &SESSION_END_BLOCK, &mut out, |raw| {
            match serde_json::from_str::<SessionEndBlock>(raw.trim()) {
                Ok(block) => Emission::SessionEnd(block),
                Err(e) => Emission::MalformedSessionEnd { raw: raw.to_string(), error: e.to_string() },
            }
        });
        out
    }

    // Both groups are guaranteed by the pattern itself: group 0 always
    // matches on a successful capture, and group 1 is unconditional (not
    // inside an alternation) in every regex passed here.
    #[allow(clippy::expect_used)]
    fn scan_blocks(
        &mut self,
        text: &str,
        re: &Regex,
        out: &mut Vec<Emission>,
        build: impl Fn(&str) -> Emission,
    ) {
        for caps in re.captures_iter(text) {
            let whole = caps.get(0).expect("group 0 always matches").as_str();
            if !self.mark_seen(whole) {
                continue;
            }
            let raw = caps.get(1).expect("capture group 1").as_str();
            out.push(build(raw));
        }
    }

    // Groups 1/2 are unconditional captures in FENCE_OPEN/SINGLE_LINE, not
    // inside an alternation, so a successful match always fills them.
    #[allow(clippy::expect_used)]
    fn scan_relay_commands(&mut self, text: &str, out: &mut Vec<Emission>) {
        let lines: Vec<&str> = text.lines().collect();
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            if line.starts_with('\\') {
                // Escaped: `\->relay:...` is literal, never parsed.
                i += 1;
                continue;
            }
            if let Some(caps) = FENCE_OPEN.captures(line) {
                let recipient_raw = caps.get(1).expect("group 1").as_str().to_string();
                let trailer = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string();
                let mut body_lines = Vec::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < lines.len() {
                    if lines[j].trim_end() == ">>>" {
                        closed = true;
                        break;
                    }
                    body_lines.push(lines[j]);
                    j += 1;
                }
                if closed {
                    let raw_block = lines[i..=j].join("\n");
                    if self.mark_seen(&raw_block) {
                        let (_, meta) = strip_meta_tags(&trailer);
                        let body = body_lines.join("\n");
                        out.push(Emission::Relay(RelayCommand {
                            recipient: Recipient::parse(&recipient_raw),
                            body,
                            meta,
                        }));
                    }
                    i = j + 1;
                    continue;
                }
                // Fence never closed (yet) — wait for more output before
                // treating it as a command.
                i += 1;
                continue;
            }
            if let Some(caps) = SINGLE_LINE.captures(line) {
                let recipient_raw = caps.get(1).expect("group 1").as_str().to_string();
                let rest = caps.get(2).expect("group 2").as_str();
                if self.mark_seen(line) {
                    let (body, meta) = strip_meta_tags(rest);
                    out.push(Emission::Relay(RelayCommand {
                        recipient: Recipient::parse(&recipient_raw),
                        body,
                        meta,
                    }));
                }
            }
            i += 1;
        }
    }

    /// Records `content`'s hash as seen; returns `true` the first time a
    /// given content hash is observed, `false` on every subsequent repeat.
    fn mark_seen(&mut self, content: &str) -> bool {
        let hash = content_hash(content);
        if self.seen.contains(&hash) {
            return false;
        }
        if self.seen.len() >= SEEN_CAPACITY {
            self.seen.pop_front();
        }
        self.seen.push_back(hash);
        true
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Strips trailing `[importance=N]` / `[replyTo=X]` / `[ack]` tags from the
/// end of a body string, accumulating them into metadata.
// Group 0 always matches on a successful capture.
#[allow(clippy::expect_used)]
fn strip_meta_tags(body: &str) -> (String, ParsedMeta) {
    let mut remaining = body.trim_end().to_string();
    let mut meta = ParsedMeta::default();
    loop {
        let Some(caps) = META_TAG.captures(&remaining) else { break };
        let whole = caps.get(0).expect("group 0").as_str();
        if let Some(imp) = caps.get(2) {
            meta.importance = imp.as_str().parse().ok();
        } else if let Some(reply) = caps.get(3) {
            meta.reply_to = Some(reply.as_str().to_string());
        } else if caps.get(1).is_some_and(|m| m.as_str() == "ack") {
            meta.ack = true;
        }
        let cut = remaining.len() - whole.len();
        remaining.truncate(cut);
    }
    (remaining.trim_end().to_string(), meta)
}

fn parse_summary(raw: &str) -> Result<SummaryBlock, String> {
    serde_json::from_str(raw.trim()).map_err(|e| e.to_string())
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
