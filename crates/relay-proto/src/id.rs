// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Message identifiers and dedup fingerprints (`SPEC_FULL.md` §2).

use rand::RngCore;
use sha2::{Digest, Sha256};

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// A 26-character, time-sortable identifier: 48 bits of millisecond epoch
/// timestamp followed by 80 bits of randomness, Crockford base32 encoded
/// (the same shape as a ULID, hand-rolled rather than pulling in a
/// dedicated crate since the core id space is this small).
pub fn new_message_id(now_ms: u64) -> String {
    let mut rand_bytes = [0u8; 10];
    rand::rng().fill_bytes(&mut rand_bytes);
    encode_ulid(now_ms, &rand_bytes)
}

// CROCKFORD is a fixed ASCII table; from_utf8 can never fail on its bytes.
#[allow(clippy::expect_used)]
fn encode_ulid(ts_ms: u64, randomness: &[u8; 10]) -> String {
    let mut bits: u128 = (ts_ms as u128 & 0xFFFF_FFFF_FFFF) << 80;
    for (i, byte) in randomness.iter().enumerate() {
        bits |= (*byte as u128) << (8 * (9 - i));
    }
    let mut out = [0u8; 26];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 125 - 5 * i;
        let idx = ((bits >> shift) & 0x1F) as usize;
        *slot = CROCKFORD[idx];
    }
    // SAFETY-free: CROCKFORD is pure ASCII.
    String::from_utf8(out.to_vec()).expect("crockford alphabet is ASCII")
}

/// Dedup fingerprint for the sliding 60s window in the router (§4.4 step 3):
/// a truncated hex digest of (sender, recipient, body, reply_to).
pub fn fingerprint(sender: &str, recipient: &str, body: &str, reply_to: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(b"\0");
    hasher.update(recipient.as_bytes());
    hasher.update(b"\0");
    hasher.update(body.as_bytes());
    hasher.update(b"\0");
    hasher.update(reply_to.unwrap_or("").as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
