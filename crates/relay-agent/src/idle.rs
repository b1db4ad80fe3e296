// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idle detector (C7): combines process state, output silence, and
//! "natural ending" text signals into a single confidence score
//! (spec.md §4.7), generalized from the teacher's
//! [`crate::composite`]-shaped tiered acceptance into a scored blend.

use std::future::Future;
use std::time::{Duration, Instant};

use regex::Regex;
use std::sync::LazyLock;

pub const DEFAULT_IDLE_THRESHOLD: f64 = 0.7;
const SILENCE_FLOOR_MS: f64 = 500.0;
const SILENCE_CEIL_MS: f64 = 3000.0;
const SILENCE_MAX_CONFIDENCE: f64 = 0.8;
const PROCESS_MAX_CONFIDENCE: f64 = 0.95;
const NATURAL_ENDING_CONFIDENCE: f64 = 0.6;
const AGREEMENT_BONUS: f64 = 0.1;
/// A signal "agrees" with idleness once it clears this floor.
const AGREE_FLOOR: f64 = 0.5;

// Compile-time-constant patterns; a failure here is a programming error
// caught immediately by any test that touches idle detection, not a
// runtime condition worth propagating as a `Result`.
#[allow(clippy::expect_used)]
static NATURAL_POSITIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[.!?…]\s*$|```\s*$|[$%#>]\s*$"#).expect("valid regex")
});
#[allow(clippy::expect_used)]
static NATURAL_NEGATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#",\s*$|[\[({]\s*$|-\s*$|[A-Za-z0-9_]\s*$"#).expect("valid regex")
});

/// One process-scheduling-state reading for the pane's foreground process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Sleeping on a tty/pipe read — the shape of a process blocked
    /// waiting for interactive input.
    WaitingOnInput,
    /// Actively scheduled/running — a definitive not-idle signal.
    Running,
    /// Neither of the above (zombie, disk-wait, unknown, or no pid).
    Other,
}

/// Reads `/proc/<pid>/stat` to classify the process's scheduling state.
/// Returns `None` if the process cannot be inspected (exited, no
/// permission, or not running under Linux procfs).
pub fn read_process_state(pid: u32) -> Option<ProcessState> {
    let text = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the parenthesized comm name are space separated; the
    // state char is the first field after the closing paren.
    let after_comm = text.rsplit_once(')')?.1;
    let state_char = after_comm.split_whitespace().next()?.chars().next()?;
    Some(match state_char {
        'R' => ProcessState::Running,
        'S' | 'D' => ProcessState::WaitingOnInput,
        _ => ProcessState::Other,
    })
}

fn process_confidence(state: Option<ProcessState>) -> Option<f64> {
    match state {
        Some(ProcessState::Running) => Some(0.0),
        Some(ProcessState::WaitingOnInput) => Some(PROCESS_MAX_CONFIDENCE),
        Some(ProcessState::Other) | None => None,
    }
}

fn silence_confidence(since_last_output: Duration) -> f64 {
    let ms = since_last_output.as_secs_f64() * 1000.0;
    if ms <= SILENCE_FLOOR_MS {
        return 0.0;
    }
    let t = ((ms - SILENCE_FLOOR_MS) / (SILENCE_CEIL_MS - SILENCE_FLOOR_MS)).min(1.0);
    t * SILENCE_MAX_CONFIDENCE
}

fn natural_ending_confidence(tail: &str) -> f64 {
    let window: String = {
        let bytes = tail.as_bytes();
        let start = bytes.len().saturating_sub(100);
        String::from_utf8_lossy(&bytes[start..]).trim_end().to_string()
    };
    if window.is_empty() {
        return 0.0;
    }
    if NATURAL_POSITIVE.is_match(&window) {
        NATURAL_ENDING_CONFIDENCE
    } else if NATURAL_NEGATIVE.is_match(&window) {
        0.0
    } else {
        0.0
    }
}

/// The combined confidence for one sample, and whether it clears the
/// configured idle threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleSample {
    pub confidence: f64,
    pub is_idle: bool,
}

/// Stateful detector: tracks the last-observed-output instant across
/// polls so callers only need to report "did the pane change".
pub struct IdleDetector {
    threshold: f64,
    last_output_at: Instant,
}

impl IdleDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, last_output_at: Instant::now() }
    }

    /// Record that new bytes were observed from the pane, resetting the
    /// output-silence clock.
    pub fn note_output(&mut self) {
        self.last_output_at = Instant::now();
    }

    /// Combine the three signals (spec.md §4.7) into one sample.
    pub fn sample(&self, pid: Option<u32>, pane_tail: &str) -> IdleSample {
        let process = process_confidence(pid.and_then(read_process_state));
        if process == Some(0.0) {
            // A running foreground process is a definitive not-idle signal.
            return IdleSample { confidence: 0.0, is_idle: false };
        }
        let silence = silence_confidence(self.last_output_at.elapsed());
        let natural = natural_ending_confidence(pane_tail);

        let signals = [process.unwrap_or(0.0), silence, natural];
        let agreeing = signals.iter().filter(|c| **c >= AGREE_FLOOR).count();
        let mut confidence = signals.iter().cloned().fold(0.0_f64, f64::max);
        if agreeing >= 2 {
            confidence = (confidence + AGREEMENT_BONUS).min(1.0);
        }
        IdleSample { confidence, is_idle: confidence >= self.threshold }
    }

    /// Polls `sample_fn` until it reports idle or `timeout` elapses.
    /// Mirrors the teacher's composite detector shape: an external
    /// capture step feeds each poll, this loop only owns timing.
    pub async fn wait_for_idle<F, Fut>(&self, timeout: Duration, poll: Duration, mut sample_fn: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IdleSample>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let sample = sample_fn().await;
            if sample.is_idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
#[path = "idle_tests.rs"]
mod tests;
