use super::*;

#[test]
fn known_epoch_formats_correctly() {
    // 2024-01-02T03:04:05.678Z
    let ms: u64 = 1_704_164_645_678;
    assert_eq!(iso8601_utc(ms), "2024-01-02T03:04:05.678Z");
}

#[test]
fn epoch_zero_is_unix_epoch() {
    assert_eq!(iso8601_utc(0), "1970-01-01T00:00:00.000Z");
}

#[test]
fn append_creates_file_and_parent_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("inbox.md");
    append(&path, "alice", "hello there", 1_704_164_645_678).expect("append");
    let contents = std::fs::read_to_string(&path).expect("read");
    assert!(contents.contains("## Message from alice | 2024-01-02T03:04:05.678Z"));
    assert!(contents.contains("hello there"));
}

#[test]
fn append_twice_keeps_both_messages() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("inbox.md");
    append(&path, "alice", "first", 1_000).expect("append");
    append(&path, "bob", "second", 2_000).expect("append");
    let contents = std::fs::read_to_string(&path).expect("read");
    assert!(contents.contains("first"));
    assert!(contents.contains("second"));
}
