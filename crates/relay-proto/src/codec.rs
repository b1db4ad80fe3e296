// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed JSON framing: a 4-byte big-endian length followed by a
//! UTF-8 JSON object carrying a `type` field. Used over the daemon's Unix
//! socket and anywhere else a relay frame crosses a byte stream.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are rejected without buffering their body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug)]
pub enum FrameError {
    /// Declared length exceeded `MAX_FRAME_LEN`.
    TooLarge { len: usize },
    /// Declared length was zero.
    Empty,
    /// Body did not parse as JSON, or lacked a `type` field.
    Malformed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooLarge { len } => write!(f, "frame of {len} bytes exceeds cap"),
            FrameError::Empty => write!(f, "frame length was zero"),
            FrameError::Malformed(detail) => write!(f, "malformed frame: {detail}"),
            FrameError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// A `Decoder`/`Encoder` pair for `tokio_util::codec::Framed`, generic over
/// the frame type carried in each direction (`ClientFrame` on the agent's
/// read side, `ServerFrame` on its write side, and vice versa in the daemon).
pub struct FrameCodec<T> {
    state: DecodeState,
    _marker: PhantomData<T>,
}

enum DecodeState {
    ReadingLength,
    ReadingBody { len: usize },
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        FrameCodec {
            state: DecodeState::ReadingLength,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = FrameError;

    // The length check above guarantees exactly LEN_PREFIX bytes are sliced.
    #[allow(clippy::expect_used)]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, FrameError> {
        loop {
            match self.state {
                DecodeState::ReadingLength => {
                    if src.len() < LEN_PREFIX {
                        return Ok(None);
                    }
                    let len = u32::from_be_bytes(src[..LEN_PREFIX].try_into().expect("4 bytes"))
                        as usize;
                    if len == 0 {
                        src.advance(LEN_PREFIX);
                        return Err(FrameError::Empty);
                    }
                    if len > MAX_FRAME_LEN {
                        src.advance(LEN_PREFIX);
                        return Err(FrameError::TooLarge { len });
                    }
                    src.advance(LEN_PREFIX);
                    self.state = DecodeState::ReadingBody { len };
                }
                DecodeState::ReadingBody { len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(len);
                    self.state = DecodeState::ReadingLength;

                    let value: serde_json::Value = serde_json::from_slice(&body)
                        .map_err(|e| FrameError::Malformed(e.to_string()))?;
                    if !value.get("type").is_some_and(|v| v.is_string()) {
                        return Err(FrameError::Malformed("missing `type` field".into()));
                    }
                    let item: T = serde_json::from_value(value)
                        .map_err(|e| FrameError::Malformed(e.to_string()))?;
                    return Ok(Some(item));
                }
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = serde_json::to_vec(&item).map_err(|e| FrameError::Malformed(e.to_string()))?;
        if body.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge { len: body.len() });
        }
        dst.reserve(LEN_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
