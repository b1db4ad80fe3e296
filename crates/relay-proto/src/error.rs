// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stable error codes surfaced to clients, generalized from the single
//! `ErrorCode` enum pattern: every error the core can produce maps to an
//! HTTP status and a wire `code` string, never a raw string message alone.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Protocol (C1/C4)
    FrameTooLarge,
    FrameMalformed,
    UnknownFrameType,
    Forbidden,
    NameInUse,
    // Routing (C4)
    NoRecipients,
    DuplicateMessage,
    BackpressureOverflow,
    DeliveryFailed,
    // Storage (C2)
    StorageUnavailable,
    StorageCorrupt,
    // Wrapper (C7-C9)
    MultiplexerMissing,
    SpawnRateLimited,
    InjectionFailed,
    AuthRevoked,
    // Daemon lifecycle (C5)
    ServerShutdown,
    // Gateway (C11)
    Unauthorized,
    BadRequest,
    NotFound,
    Internal,
}

impl ErrorCode {
    /// HTTP status code used by the dashboard gateway (C11) for this error.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::Forbidden | ErrorCode::Unauthorized => 401,
            ErrorCode::NameInUse
            | ErrorCode::NoRecipients
            | ErrorCode::BadRequest
            | ErrorCode::FrameMalformed
            | ErrorCode::UnknownFrameType => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::BackpressureOverflow => 429,
            ErrorCode::SpawnRateLimited => 429,
            ErrorCode::StorageCorrupt => 500,
            ErrorCode::StorageUnavailable => 503,
            ErrorCode::MultiplexerMissing => 503,
            ErrorCode::DeliveryFailed
            | ErrorCode::InjectionFailed
            | ErrorCode::AuthRevoked
            | ErrorCode::DuplicateMessage => 200,
            ErrorCode::FrameTooLarge => 413,
            ErrorCode::ServerShutdown => 503,
            ErrorCode::Internal => 500,
        }
    }

    /// Whether this error terminates the connection it was raised on.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorCode::FrameMalformed
                | ErrorCode::BackpressureOverflow
                | ErrorCode::ServerShutdown
                | ErrorCode::NameInUse
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::FrameTooLarge => "frame_too_large",
            ErrorCode::FrameMalformed => "frame_malformed",
            ErrorCode::UnknownFrameType => "unknown_frame_type",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NameInUse => "name_in_use",
            ErrorCode::NoRecipients => "no_recipients",
            ErrorCode::DuplicateMessage => "duplicate_message",
            ErrorCode::BackpressureOverflow => "backpressure_overflow",
            ErrorCode::DeliveryFailed => "delivery_failed",
            ErrorCode::StorageUnavailable => "storage_unavailable",
            ErrorCode::StorageCorrupt => "storage_corrupt",
            ErrorCode::MultiplexerMissing => "multiplexer_missing",
            ErrorCode::SpawnRateLimited => "spawn_rate_limited",
            ErrorCode::InjectionFailed => "injection_failed",
            ErrorCode::AuthRevoked => "auth_revoked",
            ErrorCode::ServerShutdown => "server_shutdown",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorCode {
    pub fn body(self, message: impl Into<String>) -> ErrorBody {
        ErrorBody {
            code: self,
            message: message.into(),
            detail: None,
        }
    }

    pub fn body_with_detail(self, message: impl Into<String>, detail: impl Into<String>) -> ErrorBody {
        ErrorBody {
            code: self,
            message: message.into(),
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
