use super::*;

#[test]
fn message_ids_are_26_chars_of_crockford_base32() {
    let id = new_message_id(1_700_000_000_000);
    assert_eq!(id.len(), 26);
    assert!(id.bytes().all(|b| CROCKFORD.contains(&b)));
}

#[test]
fn later_timestamps_sort_after_earlier_ones() {
    let a = new_message_id(1_700_000_000_000);
    let b = new_message_id(1_700_000_000_001);
    assert!(a < b);
}

#[test]
fn fingerprint_is_stable_for_identical_inputs() {
    let a = fingerprint("alice", "bob", "hi", None);
    let b = fingerprint("alice", "bob", "hi", None);
    assert_eq!(a, b);
}

#[test]
fn fingerprint_differs_on_reply_to() {
    let a = fingerprint("alice", "bob", "hi", None);
    let b = fingerprint("alice", "bob", "hi", Some("m1"));
    assert_ne!(a, b);
}
