use super::*;
use relay_proto::MessageMeta;

fn sample_message(id: &str, from: &str, to: &str) -> Message {
    Message {
        id: id.to_string(),
        ts_ms: 1_700_000_000_000,
        from: from.to_string(),
        to: to.to_string(),
        kind: MessageKind::Message,
        body: "hi".to_string(),
        thread: None,
        channel: None,
        is_broadcast: to == "*",
        meta: MessageMeta::default(),
        data: None,
        status: DeliveryStatus::Pending,
    }
}

#[tokio::test]
async fn appends_and_reads_back_a_message() {
    let store = Store::open_in_memory().unwrap();
    store.append_message(sample_message("m1", "alice", "bob")).await.unwrap();

    let got = store.get_message_by_id("m1".to_string()).await.unwrap();
    let got = got.expect("message should be present");
    assert_eq!(got.from, "alice");
    assert_eq!(got.to, "bob");
}

#[tokio::test]
async fn filters_messages_by_recipient() {
    let store = Store::open_in_memory().unwrap();
    store.append_message(sample_message("m1", "alice", "bob")).await.unwrap();
    store.append_message(sample_message("m2", "alice", "carol")).await.unwrap();

    let filter = MessageFilter { to: Some("bob".to_string()), ..Default::default() };
    let rows = store.get_messages(filter).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "m1");
}

#[tokio::test]
async fn update_status_is_visible_on_reread() {
    let store = Store::open_in_memory().unwrap();
    store.append_message(sample_message("m1", "alice", "bob")).await.unwrap();
    store.update_status("m1".to_string(), DeliveryStatus::Acked).await.unwrap();

    let got = store.get_message_by_id("m1".to_string()).await.unwrap().unwrap();
    assert!(matches!(got.status, DeliveryStatus::Acked));
}

#[tokio::test]
async fn session_lifecycle_round_trips() {
    let store = Store::open_in_memory().unwrap();
    store.open_session("s1".to_string(), "alice".to_string(), "claude".to_string(), 1000).await.unwrap();

    let open = store.get_sessions(Some("alice".to_string()), None).await.unwrap();
    assert_eq!(open.len(), 1);
    assert!(open[0].ended_at_ms.is_none());

    store
        .end_session("s1".to_string(), Some("did things".to_string()), "agent".to_string(), 2000)
        .await
        .unwrap();

    let closed = store.get_sessions(Some("alice".to_string()), None).await.unwrap();
    assert_eq!(closed[0].ended_at_ms, Some(2000));
    assert_eq!(closed[0].closed_by.as_deref(), Some("agent"));
}

#[tokio::test]
async fn end_all_open_sessions_only_touches_open_ones() {
    let store = Store::open_in_memory().unwrap();
    store.open_session("s1".to_string(), "alice".to_string(), "claude".to_string(), 1000).await.unwrap();
    store.open_session("s2".to_string(), "bob".to_string(), "claude".to_string(), 1000).await.unwrap();
    store.end_session("s2".to_string(), None, "agent".to_string(), 1500).await.unwrap();

    let n = store.end_all_open_sessions("error".to_string(), 9999).await.unwrap();
    assert_eq!(n, 1);

    let sessions = store.get_sessions(None, None).await.unwrap();
    let s2 = sessions.iter().find(|s| s.id == "s2").unwrap();
    assert_eq!(s2.closed_by.as_deref(), Some("agent"));
}

#[tokio::test]
async fn agent_upsert_overwrites_counters() {
    let store = Store::open_in_memory().unwrap();
    store
        .upsert_agent(AgentRow {
            name: "alice".to_string(),
            cli: "claude".to_string(),
            first_seen_ms: 1,
            last_seen_ms: 2,
            messages_sent: 1,
            messages_received: 0,
            team: None,
        })
        .await
        .unwrap();
    store
        .upsert_agent(AgentRow {
            name: "alice".to_string(),
            cli: "claude".to_string(),
            first_seen_ms: 1,
            last_seen_ms: 5,
            messages_sent: 3,
            messages_received: 2,
            team: Some("core".to_string()),
        })
        .await
        .unwrap();

    // first_seen is immutable across upserts; other fields overwrite.
    let rows = store.get_messages(MessageFilter::default()).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn summary_upsert_overwrites_wholesale() {
    let store = Store::open_in_memory().unwrap();
    let mut summary = AgentSummary {
        agent_name: "alice".to_string(),
        last_updated_ms: 1000,
        current_task: Some("writing tests".to_string()),
        completed_tasks: vec!["setup".to_string()],
        ..Default::default()
    };
    store.upsert_summary(summary.clone()).await.unwrap();

    summary.current_task = Some("reviewing".to_string());
    summary.completed_tasks = vec!["setup".to_string(), "writing tests".to_string()];
    store.upsert_summary(summary.clone()).await.unwrap();

    let got = store.get_summary("alice".to_string()).await.unwrap().unwrap();
    assert_eq!(got.current_task.as_deref(), Some("reviewing"));
    assert_eq!(got.completed_tasks.len(), 2);
}
