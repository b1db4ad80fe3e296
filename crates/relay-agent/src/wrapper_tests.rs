use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use futures_util::{SinkExt, StreamExt};
use relay_proto::FrameCodec;
use tokio::net::UnixListener;
use tokio_util::codec::Framed;

use super::*;
use crate::client::RelayClient;
use crate::pane::PaneOps;

/// A fake pane that always reports a clear, stable chat prompt so the
/// injector's own state machine never blocks these tests.
struct StaticPane {
    text: Mutex<String>,
}

impl StaticPane {
    fn new(text: &str) -> Self {
        Self { text: Mutex::new(text.to_string()) }
    }

    fn set(&self, text: &str) {
        *self.text.lock().expect("lock") = text.to_string();
    }
}

impl PaneOps for StaticPane {
    fn capture(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let text = self.text.lock().expect("lock").clone();
        Box::pin(async move { Ok(text) })
    }

    fn cursor_column(&self) -> Pin<Box<dyn Future<Output = Option<u16>> + Send + '_>> {
        Box::pin(async { Some(0) })
    }

    fn send_literal(&self, _text: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn send_enter(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn pane_pid(&self) -> Pin<Box<dyn Future<Output = Option<u32>> + Send + '_>> {
        Box::pin(async { None })
    }

    fn kill(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

async fn ack_every_send(socket_path: std::path::PathBuf) {
    let listener = UnixListener::bind(&socket_path).expect("bind");
    let (stream, _) = listener.accept().await.expect("accept");
    let mut framed = Framed::new(stream, FrameCodec::<serde_json::Value>::default());
    let _hello: serde_json::Value = framed.next().await.expect("hello").expect("frame");
    framed
        .send(serde_json::to_value(ServerFrame::Welcome { session_id: "sess-1".into() }).unwrap())
        .await
        .expect("welcome");
    while let Some(Ok(value)) = framed.next().await {
        let frame: ClientFrame = serde_json::from_value(value).expect("client frame");
        if let ClientFrame::Send { .. } = frame {
            framed
                .send(serde_json::to_value(ServerFrame::Ack { message_id: "m1".into(), duplicate: false }).unwrap())
                .await
                .expect("ack");
        }
    }
}

async fn new_connected_wrapper(dir: &tempfile::TempDir) -> (Wrapper<StaticPane>, tokio::task::JoinHandle<()>) {
    let path = dir.path().join("relay.sock");
    let daemon = tokio::spawn(ack_every_send(path.clone()));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let client = RelayClient::new(path, "alice".into(), "generic".into(), None, None);
    let pane = StaticPane::new("> ");
    let mut wrapper = Wrapper::new(pane, "alice".into(), "generic", 0.7, None, client);
    wrapper.start().await.expect("start");
    (wrapper, daemon)
}

#[tokio::test]
async fn start_transitions_idle_to_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (wrapper, daemon) = new_connected_wrapper(&dir).await;
    assert_eq!(wrapper.state(), WrapperState::Running);
    daemon.abort();
}

#[tokio::test]
async fn start_is_idempotent_once_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut wrapper, daemon) = new_connected_wrapper(&dir).await;
    wrapper.start().await.expect("second start is a no-op");
    assert_eq!(wrapper.state(), WrapperState::Running);
    daemon.abort();
}

#[tokio::test]
async fn relay_command_in_pane_output_is_forwarded_as_send() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut wrapper, daemon) = new_connected_wrapper(&dir).await;
    wrapper.pane.set("->relay:bob please review the patch\n> ");

    wrapper.poll_once().await;

    let mut saw_ack = false;
    for _ in 0..50 {
        if matches!(wrapper.client.try_recv().await, Some(ServerFrame::Ack { .. })) {
            saw_ack = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(saw_ack, "expected the parsed relay command to round-trip as an Ack");
    daemon.abort();
}

#[tokio::test]
async fn spawn_verb_is_not_forwarded_over_the_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut wrapper, daemon) = new_connected_wrapper(&dir).await;
    wrapper.pane.set("->relay:spawn bring up a reviewer\n> ");

    wrapper.poll_once().await;

    // Only a Heartbeat should have gone out; no Ack for a forwarded Send
    // will ever arrive since nothing was sent.
    let mut saw_ack = false;
    for _ in 0..5 {
        if matches!(wrapper.client.try_recv().await, Some(ServerFrame::Ack { .. })) {
            saw_ack = true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!saw_ack, "spawn is a reserved verb and must not reach the router as a Send");
    daemon.abort();
}

#[tokio::test]
async fn auth_revoked_phrase_trips_the_flag_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut wrapper, daemon) = new_connected_wrapper(&dir).await;
    assert!(!wrapper.is_auth_revoked());

    wrapper.pane.set("Your session has been terminated. Please log in again.");
    wrapper.poll_once().await;

    assert!(wrapper.is_auth_revoked());
    daemon.abort();
}

#[tokio::test]
async fn idle_sample_with_no_pid_and_quiet_pane_eventually_reports_idle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut wrapper, daemon) = new_connected_wrapper(&dir).await;
    assert_eq!(wrapper.state(), WrapperState::Running);

    // Establish a baseline capture so the silence clock starts now, not
    // when the 4s sleep below ends.
    wrapper.poll_once().await;
    tokio::time::sleep(std::time::Duration::from_secs(4)).await;
    wrapper.poll_once().await;

    assert_eq!(wrapper.state(), WrapperState::WaitingIdle);
    daemon.abort();
}
