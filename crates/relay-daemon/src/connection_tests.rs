use super::*;
use crate::registry::Registry;
use crate::store::Store;
use futures_util::{SinkExt, StreamExt};
use relay_proto::MessageMeta;
use tokio::io::duplex;
use tokio_util::codec::Framed;

fn new_router() -> Arc<Router> {
    let store = Store::open_in_memory().unwrap();
    let registry = Arc::new(Registry::new(None));
    Router::new(store, registry, Duration::from_millis(60_000), 8, 16, None)
}

#[tokio::test]
async fn hello_gets_a_welcome_and_registers_presence() {
    let router = new_router();
    let sessions = Arc::new(SessionTracker::new(router.store().clone()));
    let (server_io, client_io) = duplex(64 * 1024);

    let r2 = router.clone();
    let s2 = sessions.clone();
    let server = tokio::spawn(run_connection(server_io, r2, s2, CancellationToken::new()));

    let mut client = Framed::new(client_io, FrameCodec::<serde_json::Value>::default());
    client
        .send(serde_json::to_value(ClientFrame::Hello {
            name: "alice".into(),
            cli: Some("claude".into()),
            task: None,
            team: None,
        }).unwrap())
        .await
        .unwrap();

    let welcome: ServerFrame = serde_json::from_value(client.next().await.unwrap().unwrap()).unwrap();
    assert!(matches!(welcome, ServerFrame::Welcome { .. }));
    assert!(router.registry().is_online("alice").await);

    client.send(serde_json::to_value(ClientFrame::Bye).unwrap()).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
    assert!(!router.registry().is_online("alice").await);
}

#[tokio::test]
async fn invalid_agent_name_is_rejected_before_ready() {
    let router = new_router();
    let sessions = Arc::new(SessionTracker::new(router.store().clone()));
    let (server_io, client_io) = duplex(64 * 1024);

    let r2 = router.clone();
    let s2 = sessions.clone();
    tokio::spawn(run_connection(server_io, r2, s2, CancellationToken::new()));

    let mut client = Framed::new(client_io, FrameCodec::<serde_json::Value>::default());
    client
        .send(serde_json::to_value(ClientFrame::Hello {
            name: "*".into(),
            cli: None,
            task: None,
            team: None,
        }).unwrap())
        .await
        .unwrap();

    let error: ServerFrame = serde_json::from_value(client.next().await.unwrap().unwrap()).unwrap();
    match error {
        ServerFrame::Error { terminal, .. } => assert!(terminal),
        other => panic!("expected error frame, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_frame_type_is_a_recoverable_error_not_a_close() {
    let router = new_router();
    let sessions = Arc::new(SessionTracker::new(router.store().clone()));
    let (server_io, client_io) = duplex(64 * 1024);

    tokio::spawn(run_connection(server_io, router.clone(), sessions.clone(), CancellationToken::new()));

    let mut client = Framed::new(client_io, FrameCodec::<serde_json::Value>::default());
    client
        .send(serde_json::to_value(ClientFrame::Hello { name: "alice".into(), cli: None, task: None, team: None }).unwrap())
        .await
        .unwrap();
    let _: ServerFrame = serde_json::from_value(client.next().await.unwrap().unwrap()).unwrap();

    client.send(serde_json::json!({"type": "frobnicate"})).await.unwrap();
    let error: ServerFrame = serde_json::from_value(client.next().await.unwrap().unwrap()).unwrap();
    match error {
        ServerFrame::Error { body, terminal } => {
            assert_eq!(body.code, ErrorCode::UnknownFrameType);
            assert!(!terminal);
        }
        other => panic!("expected a non-terminal error frame, got {other:?}"),
    }

    // The connection should still be alive: a well-formed frame keeps working.
    client.send(serde_json::to_value(ClientFrame::Heartbeat).unwrap()).await.unwrap();
    client.send(serde_json::to_value(ClientFrame::Bye).unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!router.registry().is_online("alice").await);
}

#[tokio::test]
async fn send_then_ack_round_trips_through_a_second_connection() {
    let router = new_router();
    let sessions = Arc::new(SessionTracker::new(router.store().clone()));

    let (alice_server, alice_client) = duplex(64 * 1024);
    let (bob_server, bob_client) = duplex(64 * 1024);
    tokio::spawn(run_connection(alice_server, router.clone(), sessions.clone(), CancellationToken::new()));
    tokio::spawn(run_connection(bob_server, router.clone(), sessions.clone(), CancellationToken::new()));

    let mut alice = Framed::new(alice_client, FrameCodec::<serde_json::Value>::default());
    let mut bob = Framed::new(bob_client, FrameCodec::<serde_json::Value>::default());

    alice.send(serde_json::to_value(ClientFrame::Hello { name: "alice".into(), cli: None, task: None, team: None }).unwrap()).await.unwrap();
    let _: ServerFrame = serde_json::from_value(alice.next().await.unwrap().unwrap()).unwrap();
    bob.send(serde_json::to_value(ClientFrame::Hello { name: "bob".into(), cli: None, task: None, team: None }).unwrap()).await.unwrap();
    let _: ServerFrame = serde_json::from_value(bob.next().await.unwrap().unwrap()).unwrap();

    alice
        .send(serde_json::to_value(ClientFrame::Send {
            to: "bob".into(),
            body: "hi".into(),
            kind: None,
            thread: None,
            channel: None,
            data: None,
            meta: MessageMeta::default(),
        }).unwrap())
        .await
        .unwrap();

    let ack: ServerFrame = serde_json::from_value(alice.next().await.unwrap().unwrap()).unwrap();
    assert!(matches!(ack, ServerFrame::Ack { duplicate: false, .. }));

    let deliver: ServerFrame = serde_json::from_value(bob.next().await.unwrap().unwrap()).unwrap();
    let ServerFrame::Deliver { message, .. } = deliver else { panic!("expected deliver") };
    bob.send(serde_json::to_value(ClientFrame::Ack { message_id: message.id.clone() }).unwrap()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = router.store().get_message_by_id(message.id).await.unwrap().unwrap();
    assert!(matches!(stored.status, relay_proto::DeliveryStatus::Acked));
}
