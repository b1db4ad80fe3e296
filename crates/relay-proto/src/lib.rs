// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types and framing shared by every process that speaks the relay
//! socket protocol: the daemon, the CLI wrapper, and any dashboard gateway
//! client.

pub mod codec;
pub mod error;
pub mod frame;
pub mod id;

pub use codec::{FrameCodec, FrameError};
pub use error::ErrorCode;
pub use frame::{ClientFrame, DeliveryStatus, Message, MessageData, MessageKind, ServerFrame};
pub use id::{fingerprint, new_message_id};
