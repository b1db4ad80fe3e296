// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The router (C4): fan-out, broadcast, channel, and team delivery; dedup;
//! acks; backpressure. Connection state transitions mirror the ASCII
//! diagram in `SPEC_FULL.md` §4.4 with a plain enum + `match`, the same
//! shape the teacher resolves `AgentState` transitions with
//! (`driver::composite::CompositeDetector`) rather than a state-machine
//! crate. Per-connection outbound queues are bounded `mpsc` channels,
//! generalized from the teacher's `mpsc::channel(64)` / `mpsc::channel(256)`
//! convention in `broker/mux.rs` and `driver/composite.rs`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_proto::{
    fingerprint, new_message_id, DeliveryStatus, ErrorCode, Message, MessageData, MessageKind,
    MessageMeta, ServerFrame,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::store::Store;

/// Per-connection state machine (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Ready,
    Closed,
}

impl ConnState {
    /// Validates a transition; mirrors the ASCII diagram exactly.
    pub fn advance(self, event: ConnEvent) -> Option<ConnState> {
        match (self, event) {
            (ConnState::New, ConnEvent::ValidHello) => Some(ConnState::Ready),
            (ConnState::New, ConnEvent::InvalidHello) => Some(ConnState::Closed),
            (ConnState::Ready, ConnEvent::ByeOrDrop) => Some(ConnState::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    ValidHello,
    InvalidHello,
    ByeOrDrop,
}

/// What a `send` resolved to, handed back to the connection task so it can
/// emit the right `ServerFrame::Ack`/`Error` to the sender.
#[derive(Debug)]
pub enum SendOutcome {
    Ack { message_id: String, duplicate: bool },
    Error(ErrorCode),
}

struct ConnHandle {
    tx: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
    /// Out-of-band, unbounded sender used only to force an error frame
    /// (e.g. `BackpressureOverflow`) past an already-full `tx` before the
    /// connection is torn down.
    control_tx: mpsc::UnboundedSender<ServerFrame>,
}

/// A message queued for a recipient who was offline at send time, per
/// spec.md §4.4 step 5 and Open Question (ii).
struct PendingRedelivery {
    message: Message,
    addressed_to: String,
    sent_at_ms: u64,
    ttl_ms: Option<u64>,
}

pub struct Router {
    store: Store,
    registry: Arc<Registry>,
    connections: RwLock<HashMap<String, ConnHandle>>,
    dedup: Mutex<VecDeque<(Instant, String)>>,
    dedup_window: Duration,
    offline: Mutex<HashMap<String, Vec<PendingRedelivery>>>,
    soft_limit: usize,
    hard_limit: usize,
    /// `topic → subscriber connection names` for the socket-level
    /// `Subscribe`/`Unsubscribe` frames (spec.md §3's Subscription
    /// entity). Separate from the dashboard gateway's own WebSocket
    /// subscription bookkeeping in `sessions::SessionTracker`.
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    state_path: Option<PathBuf>,
}

/// Serialized shape of `team/bridge-state.json` (spec.md §6): a snapshot of
/// open connections and in-flight backpressure/redelivery state, written
/// atomically on every transition so an external reader doesn't need to
/// talk to the daemon.
#[derive(serde::Serialize)]
struct BridgeStateSnapshot {
    connected: Vec<String>,
    queue_hard_limit: usize,
    queue_soft_limit: usize,
    pending_redelivery: HashMap<String, usize>,
}

impl Router {
    pub fn new(
        store: Store,
        registry: Arc<Registry>,
        dedup_window: Duration,
        soft_limit: usize,
        hard_limit: usize,
        state_path: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Router {
            store,
            registry,
            connections: RwLock::new(HashMap::new()),
            dedup: Mutex::new(VecDeque::new()),
            dedup_window,
            offline: Mutex::new(HashMap::new()),
            soft_limit,
            hard_limit,
            subscriptions: RwLock::new(HashMap::new()),
            state_path,
        })
    }

    /// Writes `team/bridge-state.json` atomically (temp-file + rename),
    /// mirroring the registry's own presence-snapshot pattern.
    async fn persist_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let connected: Vec<String> = self.connections.read().await.keys().cloned().collect();
        let pending_redelivery = self
            .offline
            .lock()
            .await
            .iter()
            .map(|(name, entries)| (name.clone(), entries.len()))
            .collect();
        let snapshot = BridgeStateSnapshot {
            connected,
            queue_hard_limit: self.hard_limit,
            queue_soft_limit: self.soft_limit,
            pending_redelivery,
        };
        write_atomic_json(path, &snapshot);
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    /// Registers the outbound channel for a newly `READY` connection.
    /// Returns the cancellation token of a previous live connection for
    /// the same name, if any (Open Question iii: the old connection's
    /// pending queue is dropped, not drained).
    pub async fn register(
        self: &Arc<Self>,
        name: &str,
        tx: mpsc::Sender<ServerFrame>,
        cancel: CancellationToken,
        control_tx: mpsc::UnboundedSender<ServerFrame>,
    ) -> Option<CancellationToken> {
        let mut conns = self.connections.write().await;
        let old = conns
            .insert(name.to_string(), ConnHandle { tx, cancel, control_tx })
            .map(|h| h.cancel);
        drop(conns);
        self.replay_pending(name);
        self.persist_state().await;
        old
    }

    pub async fn unregister(&self, name: &str) {
        self.connections.write().await.remove(name);
        self.unsubscribe_all(name).await;
        self.persist_state().await;
    }

    /// Subscribes `name`'s connection to `topic` (`presence` or
    /// `agent/<name>/logs`).
    pub async fn subscribe(&self, name: &str, topic: String) {
        self.subscriptions
            .write()
            .await
            .entry(topic)
            .or_default()
            .insert(name.to_string());
    }

    pub async fn unsubscribe(&self, name: &str, topic: &str) {
        let mut subs = self.subscriptions.write().await;
        if let Some(subscribers) = subs.get_mut(topic) {
            subscribers.remove(name);
        }
    }

    async fn unsubscribe_all(&self, name: &str) {
        let mut subs = self.subscriptions.write().await;
        for subscribers in subs.values_mut() {
            subscribers.remove(name);
        }
    }

    /// Pushes a `Presence` frame to every connection subscribed to
    /// `topic`. Best-effort: a full or closed outbound queue is skipped
    /// rather than tearing down the connection (presence is not
    /// ack-tracked).
    pub async fn publish(&self, topic: &str, payload: serde_json::Value) {
        let subscribers = {
            let subs = self.subscriptions.read().await;
            match subs.get(topic) {
                Some(names) => names.clone(),
                None => return,
            }
        };
        if subscribers.is_empty() {
            return;
        }
        let conns = self.connections.read().await;
        for name in subscribers {
            if let Some(handle) = conns.get(&name) {
                let _ = handle.tx.try_send(ServerFrame::Presence {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }

    pub async fn queue_headroom(&self, name: &str) -> Option<usize> {
        let conns = self.connections.read().await;
        conns.get(name).map(|h| h.tx.capacity())
    }

    /// Routing algorithm for a `send` frame (spec.md §4.4 steps 1-7).
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_send(
        self: &Arc<Self>,
        sender: &str,
        to: &str,
        body: String,
        kind: MessageKind,
        thread: Option<String>,
        channel: Option<String>,
        data: Option<MessageData>,
        meta: MessageMeta,
        now_ms: u64,
    ) -> SendOutcome {
        let recipients = match self.resolve_recipients(sender, to).await {
            Ok(r) => r,
            Err(code) => return SendOutcome::Error(code),
        };

        let fp = fingerprint(sender, to, &body, meta.reply_to.as_deref());
        if self.check_and_record_dedup(&fp, now_ms).await {
            return SendOutcome::Ack {
                message_id: fp,
                duplicate: true,
            };
        }

        let id = new_message_id(now_ms);
        let is_broadcast = to == "*";
        let message = Message {
            id: id.clone(),
            ts_ms: now_ms,
            from: sender.to_string(),
            to: to.to_string(),
            kind,
            body,
            thread,
            channel,
            is_broadcast,
            meta,
            data,
            status: DeliveryStatus::Pending,
        };

        if let Err(e) = self.store.append_message(message.clone()).await {
            warn!(error = %e, "storage unavailable while appending message; holding in memory only");
        }
        self.registry.record_sent(sender).await;

        for recipient in &recipients {
            self.deliver_to_one(recipient, message.clone(), to.to_string(), now_ms)
                .await;
            if message.meta.requires_ack {
                if let Some(ttl_ms) = message.meta.ttl_ms {
                    self.spawn_ttl_watch(id.clone(), recipient.clone(), ttl_ms, now_ms);
                }
            }
        }

        SendOutcome::Ack {
            message_id: id,
            duplicate: false,
        }
    }

    /// Normalizes a recipient per spec.md §4.4 step 2. `*` broadcasts to
    /// every other online agent; `team:<name>` expands to that team's
    /// online members (empty ⇒ `NoRecipients`); otherwise a single name.
    async fn resolve_recipients(&self, sender: &str, to: &str) -> Result<Vec<String>, ErrorCode> {
        if to.is_empty() {
            return Err(ErrorCode::BadRequest);
        }
        if to == "*" {
            let mut online = Vec::new();
            for record in self.registry.snapshot().await {
                if record.name != sender && self.registry.is_online(&record.name).await {
                    online.push(record.name);
                }
            }
            let online: HashSet<String> = online.into_iter().collect();
            return Ok(online.into_iter().collect());
        }
        if let Some(team) = to.strip_prefix("team:") {
            let members = self.registry.online_team_members(team).await;
            if members.is_empty() {
                return Err(ErrorCode::NoRecipients);
            }
            return Ok(members);
        }
        Ok(vec![to.to_string()])
    }

    /// Sliding dedup window (spec.md §4.4 step 3 / §2): prunes entries
    /// older than the window, then checks+records in one pass.
    async fn check_and_record_dedup(&self, fp: &str, now_ms: u64) -> bool {
        let now = Instant::now();
        let mut window = self.dedup.lock().await;
        while let Some((t, _)) = window.front() {
            if now.duration_since(*t) > self.dedup_window {
                window.pop_front();
            } else {
                break;
            }
        }
        let _ = now_ms;
        if window.iter().any(|(_, existing)| existing == fp) {
            return true;
        }
        window.push_back((now, fp.to_string()));
        false
    }

    async fn deliver_to_one(
        self: &Arc<Self>,
        recipient: &str,
        message: Message,
        addressed_to: String,
        now_ms: u64,
    ) {
        let handle = {
            let conns = self.connections.read().await;
            conns.get(recipient).map(|h| (h.tx.clone(), h.control_tx.clone()))
        };

        let Some((tx, control_tx)) = handle else {
            self.queue_offline(recipient, message, addressed_to, now_ms).await;
            return;
        };

        let frame = ServerFrame::Deliver {
            message: message.clone(),
            addressed_to,
        };
        match tx.try_send(frame) {
            Ok(()) => {
                self.registry.record_received(recipient).await;
                let _ = self.store.update_status(message.id.clone(), DeliveryStatus::Delivered).await;
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(recipient, "outbound queue at hard limit; closing connection");
                let _ = control_tx.send(ServerFrame::Error {
                    body: ErrorCode::BackpressureOverflow.body("outbound queue exceeded hard limit"),
                    terminal: true,
                });
                if let Some(handle) = self.connections.write().await.remove(recipient) {
                    handle.cancel.cancel();
                }
                let _ = self.store.update_status(message.id.clone(), DeliveryStatus::Failed).await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.queue_offline(recipient, message, addressed_to, now_ms).await;
            }
        }
    }

    async fn queue_offline(&self, recipient: &str, message: Message, addressed_to: String, now_ms: u64) {
        if !message.meta.requires_ack {
            debug!(recipient, "recipient offline, persist-only delivery");
            return;
        }
        let mut offline = self.offline.lock().await;
        offline.entry(recipient.to_string()).or_default().push(PendingRedelivery {
            ttl_ms: message.meta.ttl_ms,
            sent_at_ms: now_ms,
            message,
            addressed_to,
        });
        drop(offline);
        self.persist_state().await;
    }

    /// Replays queued redeliveries for `name` on reconnect. Per Open
    /// Question (ii): an entry with no TTL is attempted exactly once and
    /// dropped regardless of outcome; a TTL'd entry already expired is
    /// marked failed instead of delivered.
    fn replay_pending(self: &Arc<Self>, name: &str) {
        let this = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let pending = {
                let mut offline = this.offline.lock().await;
                offline.remove(&name).unwrap_or_default()
            };
            if pending.is_empty() {
                return;
            }
            this.persist_state().await;
            let now_ms = crate::time::now_ms();
            for entry in pending {
                let expired = entry
                    .ttl_ms
                    .is_some_and(|ttl| now_ms.saturating_sub(entry.sent_at_ms) > ttl);
                if expired {
                    let _ = this.store.update_status(entry.message.id.clone(), DeliveryStatus::Failed).await;
                    continue;
                }
                this.deliver_to_one(&name, entry.message, entry.addressed_to, now_ms).await;
            }
        });
    }

    /// Spawns a deadline watcher for a TTL'd `requires_ack` message so
    /// scenario C's "61s pass, still pending ⇒ failed" holds even if the
    /// recipient never reconnects.
    pub fn spawn_ttl_watch(self: &Arc<Self>, message_id: String, recipient: String, ttl_ms: u64, sent_at_ms: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
            let _ = sent_at_ms;
            if let Ok(Some(current)) = this.store.get_message_by_id(message_id.clone()).await {
                if matches!(current.status, DeliveryStatus::Pending) {
                    let _ = this.store.update_status(message_id.clone(), DeliveryStatus::Failed).await;
                    let mut offline = this.offline.lock().await;
                    if let Some(entries) = offline.get_mut(&recipient) {
                        entries.retain(|e| e.message.id != message_id);
                    }
                }
            }
        });
    }

    pub async fn handle_ack(&self, message_id: &str) {
        let _ = self.store.update_status(message_id.to_string(), DeliveryStatus::Acked).await;
    }
}

/// Shared atomic temp-file-then-rename writer for the `team/*.json`
/// snapshots (spec.md §6), matching `registry::Registry::persist`.
fn write_atomic_json<T: serde::Serialize>(path: &Path, value: &T) {
    let Ok(json) = serde_json::to_string_pretty(value) else {
        return;
    };
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let tmp = path.with_extension("json.tmp");
    if std::fs::write(&tmp, json).is_ok() {
        let _ = std::fs::rename(&tmp, path);
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
