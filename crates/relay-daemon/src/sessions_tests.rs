use super::*;
use crate::store::Store;

fn tracker() -> SessionTracker {
    SessionTracker::new(Store::open_in_memory().unwrap())
}

#[tokio::test]
async fn open_then_end_closes_the_session_in_storage() {
    let t = tracker();
    let id = t.open("alice", "claude", 1000).await;
    t.end(&id, Some("done".to_string()), "agent", 2000).await;

    let sessions = t.store.get_sessions(Some("alice".to_string()), None).await.unwrap();
    assert_eq!(sessions[0].closed_by.as_deref(), Some("agent"));
    assert_eq!(sessions[0].summary.as_deref(), Some("done"));
}

#[tokio::test]
async fn tail_log_ring_buffer_keeps_the_most_recent_lines() {
    let t = tracker();
    for i in 0..5 {
        t.tail_log("alice", &format!("line {i}")).await;
    }
    let tail = t.tail("alice", 2).await;
    assert_eq!(tail, vec!["line 3".to_string(), "line 4".to_string()]);
}

#[tokio::test]
async fn subscribers_receive_new_lines_appended_after_subscribing() {
    let t = tracker();
    let mut rx = t.subscribe("alice").await;
    t.tail_log("alice", "hello").await;
    let line = rx.try_recv().unwrap();
    assert_eq!(line, "hello");
}

#[tokio::test]
async fn has_agent_is_false_until_first_log_or_subscription() {
    let t = tracker();
    assert!(!t.has_agent("alice").await);
    t.tail_log("alice", "hi").await;
    assert!(t.has_agent("alice").await);
}
