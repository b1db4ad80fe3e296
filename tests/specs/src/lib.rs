// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `relayd` binary as a subprocess and exercises it over
//! its dashboard HTTP API and its raw Unix-socket agent protocol.

use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_proto::{ClientFrame, FrameCodec, ServerFrame};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

/// Resolve the path to a compiled workspace binary (`relayd` or
/// `relay-agent`) next to this test crate's own target directory.
pub fn workspace_binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `relayd` process, killed on drop, with its project-scoped
/// socket and HTTP address ready to use.
pub struct RelayDaemon {
    child: Child,
    http_addr: String,
    socket_path: PathBuf,
    _data_dir: tempfile::TempDir,
}

impl RelayDaemon {
    /// Spawns `relayd` with an isolated, temporary data directory and a
    /// free HTTP port.
    pub fn start() -> anyhow::Result<Self> {
        let binary = workspace_binary("relayd");
        anyhow::ensure!(binary.exists(), "relayd binary not found at {}", binary.display());

        let data_dir = tempfile::tempdir()?;
        let socket_path = data_dir.path().join("relay.sock");
        let port = free_port()?;
        let http_addr = format!("127.0.0.1:{port}");

        let child = std::process::Command::new(&binary)
            .arg("--socket")
            .arg(&socket_path)
            .arg("--data-dir")
            .arg(data_dir.path())
            .arg("--http-addr")
            .arg(&http_addr)
            .arg("--log-format")
            .arg("text")
            .arg("--log-level")
            .arg("warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, http_addr, socket_path, _data_dir: data_dir })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    /// Polls `/health` until it responds or `timeout` elapses.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/health", self.base_url());
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("relayd did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Waits for the socket file to exist, which happens once `relayd`
    /// has bound and started accepting agent connections.
    pub async fn wait_socket_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.socket_path.exists() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("relayd socket did not appear within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for RelayDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A raw agent connection to `relayd`'s Unix socket, used to drive
/// Scenario A-E literally against a real daemon process.
pub struct AgentSocket {
    framed: Framed<UnixStream, FrameCodec<serde_json::Value>>,
}

impl AgentSocket {
    /// Connects and completes the HELLO/Welcome handshake.
    pub async fn connect(socket_path: &Path, name: &str) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let mut framed = Framed::new(stream, FrameCodec::<serde_json::Value>::default());
        let hello = ClientFrame::Hello { name: name.to_string(), cli: None, task: None, team: None };
        framed.send(serde_json::to_value(&hello)?).await?;
        match Self::next_frame_of(&mut framed).await? {
            Some(ServerFrame::Welcome { .. }) => {}
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        }
        Ok(Self { framed })
    }

    pub async fn send_frame(&mut self, frame: ClientFrame) -> anyhow::Result<()> {
        self.framed.send(serde_json::to_value(&frame)?).await?;
        Ok(())
    }

    async fn next_frame_of(
        framed: &mut Framed<UnixStream, FrameCodec<serde_json::Value>>,
    ) -> anyhow::Result<Option<ServerFrame>> {
        match framed.next().await {
            Some(Ok(value)) => Ok(Some(serde_json::from_value(value)?)),
            Some(Err(e)) => Err(anyhow::anyhow!(e.to_string())),
            None => Ok(None),
        }
    }

    /// Waits up to `timeout` for the next server frame.
    pub async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Option<ServerFrame>> {
        match tokio::time::timeout(timeout, Self::next_frame_of(&mut self.framed)).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    /// Drains frames until one matches `predicate` or `timeout` elapses.
    pub async fn recv_matching(
        &mut self,
        timeout: Duration,
        mut predicate: impl FnMut(&ServerFrame) -> bool,
    ) -> anyhow::Result<Option<ServerFrame>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.recv(remaining).await? {
                Some(frame) if predicate(&frame) => return Ok(Some(frame)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}
