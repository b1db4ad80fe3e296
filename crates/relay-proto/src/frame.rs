// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame bodies exchanged over the relay socket, tabulated in full in
//! `SPEC_FULL.md` §4.4. `ClientFrame` flows agent→daemon, `ServerFrame`
//! flows daemon→agent. `#[serde(tag = "type")]` gives each variant the
//! `type` discriminant the codec requires.

use serde::{Deserialize, Serialize};

use crate::error::ErrorBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    System,
    Log,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Acked,
    Failed,
}

/// Opaque structured side-payload. The router never inspects it; it is
/// persisted as a JSON byte string and handed back verbatim on delivery.
pub type MessageData = serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_ack: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub ts_ms: u64,
    pub from: String,
    pub to: String,
    pub kind: MessageKind,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub is_broadcast: bool,
    #[serde(default)]
    pub meta: MessageMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<MessageData>,
    pub status: DeliveryStatus,
}

/// Frames an agent connection may send once `READY` (after a successful
/// `Hello`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello {
        name: String,
        cli: Option<String>,
        task: Option<String>,
        team: Option<String>,
    },
    Send {
        to: String,
        body: String,
        #[serde(default)]
        kind: Option<MessageKind>,
        #[serde(default)]
        thread: Option<String>,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        data: Option<MessageData>,
        #[serde(default)]
        meta: MessageMeta,
    },
    Ack {
        message_id: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Heartbeat,
    Log {
        body: String,
    },
    /// Replaces the agent's running summary wholesale (spec.md §4.9's
    /// "persist via C2"). Sent by the wrapper when it parses a
    /// `[[SUMMARY]]` block out of the pane.
    Summary {
        #[serde(default)]
        current_task: Option<String>,
        #[serde(default)]
        completed_tasks: Vec<String>,
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        decisions: Vec<String>,
        #[serde(default)]
        files: Vec<String>,
    },
    /// Closes the agent's current session with `closedBy = "agent"`,
    /// carrying the `[[SESSION_END]]` block's summary text.
    SessionEnd {
        summary: String,
        #[serde(default)]
        completed_tasks: Vec<String>,
    },
    Bye,
}

/// Frames the daemon sends to an agent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        session_id: String,
    },
    Deliver {
        message: Message,
        /// The recipient the sender addressed — lets a broadcast
        /// recipient distinguish it from a directed message.
        addressed_to: String,
    },
    Ack {
        message_id: String,
        #[serde(default)]
        duplicate: bool,
    },
    Presence {
        topic: String,
        payload: serde_json::Value,
    },
    Error {
        #[serde(flatten)]
        body: ErrorBody,
        terminal: bool,
    },
}
