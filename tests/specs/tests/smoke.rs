// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end acceptance tests matching spec.md §8's literal scenarios,
//! each spawning a real `relayd` binary and driving it over its raw
//! agent socket protocol and its dashboard HTTP API.

use std::time::Duration;

use relay_proto::frame::MessageMeta;
use relay_proto::{ClientFrame, MessageKind, ServerFrame};
use relay_specs::{AgentSocket, RelayDaemon};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn start_daemon() -> anyhow::Result<RelayDaemon> {
    let daemon = RelayDaemon::start()?;
    daemon.wait_healthy(TIMEOUT).await?;
    daemon.wait_socket_ready(TIMEOUT).await?;
    Ok(daemon)
}

// -- Scenario A: single send/receive -------------------------------------------

#[tokio::test]
async fn scenario_a_single_send_receive() -> anyhow::Result<()> {
    let daemon = start_daemon().await?;
    let mut alice = AgentSocket::connect(daemon.socket_path(), "Alice").await?;
    let mut bob = AgentSocket::connect(daemon.socket_path(), "Bob").await?;

    alice
        .send_frame(ClientFrame::Send {
            to: "Bob".into(),
            body: "hi".into(),
            kind: None,
            thread: None,
            channel: None,
            data: None,
            meta: Default::default(),
        })
        .await?;

    let deliver = bob
        .recv_matching(TIMEOUT, |f| matches!(f, ServerFrame::Deliver { .. }))
        .await?
        .ok_or_else(|| anyhow::anyhow!("Bob never received a deliver frame"))?;
    match deliver {
        ServerFrame::Deliver { message, .. } => {
            assert_eq!(message.from, "Alice");
            assert_eq!(message.body, "hi");
        }
        other => anyhow::bail!("unexpected frame: {other:?}"),
    }

    let client = reqwest::Client::new();
    let history: serde_json::Value = client
        .get(format!("{}/api/history/messages?to=Bob", daemon.base_url()))
        .send()
        .await?
        .json()
        .await?;
    let messages = history["messages"].as_array().expect("messages array");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["body"], "hi");

    Ok(())
}

// -- Scenario B: broadcast -------------------------------------------------------

#[tokio::test]
async fn scenario_b_broadcast_excludes_sender() -> anyhow::Result<()> {
    let daemon = start_daemon().await?;
    let mut alice = AgentSocket::connect(daemon.socket_path(), "Alice").await?;
    let mut bob = AgentSocket::connect(daemon.socket_path(), "Bob").await?;
    let mut carol = AgentSocket::connect(daemon.socket_path(), "Carol").await?;

    alice
        .send_frame(ClientFrame::Send {
            to: "*".into(),
            body: "hello all".into(),
            kind: None,
            thread: None,
            channel: None,
            data: None,
            meta: Default::default(),
        })
        .await?;

    for recipient in [&mut bob, &mut carol] {
        let deliver = recipient
            .recv_matching(TIMEOUT, |f| matches!(f, ServerFrame::Deliver { .. }))
            .await?
            .ok_or_else(|| anyhow::anyhow!("broadcast recipient never received a deliver frame"))?;
        match deliver {
            ServerFrame::Deliver { message, .. } => {
                assert_eq!(message.body, "hello all");
                assert!(message.is_broadcast);
            }
            other => anyhow::bail!("unexpected frame: {other:?}"),
        }
    }

    // Alice must not receive her own broadcast.
    let own_echo = alice.recv(Duration::from_millis(500)).await?;
    assert!(
        !matches!(own_echo, Some(ServerFrame::Deliver { .. })),
        "sender should not receive its own broadcast"
    );

    Ok(())
}

// -- Scenario C: offline target with requires_ack --------------------------------

#[tokio::test]
async fn scenario_c_offline_target_delivers_on_reconnect_and_acks() -> anyhow::Result<()> {
    let daemon = start_daemon().await?;
    let mut alice = AgentSocket::connect(daemon.socket_path(), "Alice").await?;

    alice
        .send_frame(ClientFrame::Send {
            to: "Dave".into(),
            body: "are you there".into(),
            kind: Some(MessageKind::Message),
            thread: None,
            channel: None,
            data: None,
            meta: MessageMeta { requires_ack: true, ttl_ms: Some(60_000), ..Default::default() },
        })
        .await?;

    let mut dave = AgentSocket::connect(daemon.socket_path(), "Dave").await?;
    let deliver = dave
        .recv_matching(TIMEOUT, |f| matches!(f, ServerFrame::Deliver { .. }))
        .await?
        .ok_or_else(|| anyhow::anyhow!("Dave never received the queued message"))?;
    let message_id = match deliver {
        ServerFrame::Deliver { message, .. } => message.id,
        other => anyhow::bail!("unexpected frame: {other:?}"),
    };

    dave.send_frame(ClientFrame::Ack { message_id: message_id.clone() }).await?;

    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let history: serde_json::Value = client
            .get(format!("{}/api/history/messages?to=Dave", daemon.base_url()))
            .send()
            .await?
            .json()
            .await?;
        let messages = history["messages"].as_array().expect("messages array");
        if messages.iter().any(|m| m["id"] == message_id && m["status"] == "acked") {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("message never converged to acked status");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// -- Scenario F: spawn and release ------------------------------------------------

#[tokio::test]
async fn scenario_f_spawn_then_release() -> anyhow::Result<()> {
    let daemon = start_daemon().await?;
    let client = reqwest::Client::new();

    let spawn_resp = client
        .post(format!("{}/api/spawn", daemon.base_url()))
        .json(&serde_json::json!({ "name": "W1", "cli": "claude" }))
        .send()
        .await?;
    assert_eq!(spawn_resp.status().as_u16(), 200);
    let spawn_body: serde_json::Value = spawn_resp.json().await?;
    assert_eq!(spawn_body["name"], "W1");

    let spawned: serde_json::Value =
        client.get(format!("{}/api/spawned", daemon.base_url())).send().await?.json().await?;
    let names: Vec<&str> =
        spawned["spawned"].as_array().expect("spawned array").iter().map(|w| w["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"W1"));

    let release_resp =
        client.delete(format!("{}/api/spawned/W1", daemon.base_url())).send().await?;
    assert_eq!(release_resp.status().as_u16(), 200);

    let spawned_after: serde_json::Value =
        client.get(format!("{}/api/spawned", daemon.base_url())).send().await?.json().await?;
    let names_after: Vec<&str> = spawned_after["spawned"]
        .as_array()
        .expect("spawned array")
        .iter()
        .map(|w| w["name"].as_str().unwrap())
        .collect();
    assert!(!names_after.contains(&"W1"));

    Ok(())
}
