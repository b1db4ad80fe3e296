// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wall-clock milliseconds since the Unix epoch, shared with the daemon's
//! own `relay_daemon::time::now_ms` so inbox timestamps and HELLO-adjacent
//! clocks agree on one notion of "now".

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
