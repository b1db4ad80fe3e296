// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-based fallback inbox (spec.md §6): when the injector (C8)
//! exhausts its retries, the message is appended here instead of being
//! dropped, as `## Message from <sender> | <iso8601>` sections in an
//! `inbox.md` file the human operator (or the agent, on its next glance
//! at its working directory) can read directly.

use std::io::Write;
use std::path::Path;

/// Appends one message to the agent's fallback inbox file, creating it
/// (and its parent directory) if needed.
pub fn append(path: &Path, from: &str, body: &str, now_ms: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "## Message from {from} | {}", iso8601_utc(now_ms))?;
    writeln!(file)?;
    writeln!(file, "{body}")?;
    writeln!(file)?;
    Ok(())
}

/// Formats Unix epoch milliseconds as a UTC ISO 8601 timestamp
/// (`YYYY-MM-DDTHH:MM:SS.mmmZ`), hand-rolled via Howard Hinnant's
/// days-from-civil algorithm since the workspace carries no date/time
/// crate.
fn iso8601_utc(ms: u64) -> String {
    let total_secs = ms / 1000;
    let millis = ms % 1000;
    let days = (total_secs / 86_400) as i64;
    let secs_of_day = total_secs % 86_400;
    let (hour, minute, second) = (secs_of_day / 3600, (secs_of_day % 3600) / 60, secs_of_day % 60);
    let (year, month, day) = civil_from_days(days);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z")
}

/// <http://howardhinnant.github.io/date_algorithms.html#civil_from_days>
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
#[path = "inbox_tests.rs"]
mod tests;
