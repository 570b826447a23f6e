// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame decoding and validation.
//!
//! Size limits are enforced before any payload parsing so a hostile frame
//! costs at most one bounded JSON parse. Rejections are reported to the
//! caller as [`DecodeError`]; the connection stays open.

use serde::de::DeserializeOwned;

use crate::error::ErrorCode;
use crate::protocol::{Envelope, MessageKind, Payload};

/// Per-message byte budget.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
/// Tighter budget for terminal output chunks.
pub const MAX_TERMINAL_FRAME_BYTES: usize = 64 * 1024;

/// A rejected inbound frame.
#[derive(Debug, Clone)]
pub struct DecodeError {
    pub code: ErrorCode,
    pub message: String,
}

impl DecodeError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Decode and validate one inbound text frame.
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::new(
            ErrorCode::MessageTooLarge,
            format!("frame exceeds {MAX_FRAME_BYTES} bytes"),
        ));
    }

    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| DecodeError::new(ErrorCode::InvalidMessageFormat, format!("not JSON: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::new(ErrorCode::InvalidMessageFormat, "frame is not an object"))?;

    let tag = obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DecodeError::new(ErrorCode::InvalidMessageFormat, "missing envelope field: type"))?;

    let kind = MessageKind::parse(tag).ok_or_else(|| {
        DecodeError::new(ErrorCode::UnsupportedMessageType, format!("unsupported message type: {tag}"))
    })?;

    // The terminal budget is checked once the tag is known, still before the
    // payload is deserialized.
    if kind == MessageKind::TerminalOutput && raw.len() > MAX_TERMINAL_FRAME_BYTES {
        return Err(DecodeError::new(
            ErrorCode::MessageTooLarge,
            format!("terminal chunk exceeds {MAX_TERMINAL_FRAME_BYTES} bytes"),
        ));
    }

    let id = obj
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DecodeError::new(ErrorCode::InvalidMessageFormat, "missing envelope field: id"))?
        .to_owned();

    let timestamp = obj
        .get("timestamp")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| {
            DecodeError::new(ErrorCode::InvalidMessageFormat, "missing envelope field: timestamp")
        })?;

    let payload_value = obj
        .get("payload")
        .cloned()
        .ok_or_else(|| DecodeError::new(ErrorCode::InvalidMessageFormat, "missing envelope field: payload"))?;

    let payload = decode_payload(kind, payload_value)?;

    Ok(Envelope { kind, id, timestamp, payload })
}

fn typed<T: DeserializeOwned>(kind: MessageKind, value: serde_json::Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| {
        DecodeError::new(ErrorCode::ValidationFailed, format!("invalid {kind} payload: {e}"))
    })
}

fn decode_payload(kind: MessageKind, value: serde_json::Value) -> Result<Payload, DecodeError> {
    if !value.is_object() {
        return Err(DecodeError::new(
            ErrorCode::ValidationFailed,
            format!("invalid {kind} payload: not an object"),
        ));
    }
    Ok(match kind {
        MessageKind::AgentConnect => Payload::AgentConnect(typed(kind, value)?),
        MessageKind::AgentHeartbeat => Payload::AgentHeartbeat(typed(kind, value)?),
        MessageKind::AgentError => Payload::AgentError(typed(kind, value)?),
        MessageKind::AgentStatusUpdate => Payload::AgentStatusUpdate(typed(kind, value)?),
        MessageKind::CommandRequest => Payload::CommandRequest(typed(kind, value)?),
        MessageKind::CommandAck => Payload::CommandAck(typed(kind, value)?),
        MessageKind::CommandCancel => Payload::CommandCancel(typed(kind, value)?),
        MessageKind::CommandComplete => Payload::CommandComplete(typed(kind, value)?),
        MessageKind::CommandQuery => Payload::CommandQuery(typed(kind, value)?),
        MessageKind::CommandStatusUpdate => Payload::CommandStatusUpdate(typed(kind, value)?),
        MessageKind::TerminalOutput => Payload::TerminalOutput(typed(kind, value)?),
        MessageKind::TraceEvent => Payload::TraceEvent(typed(kind, value)?),
        MessageKind::QueuePositionUpdate => Payload::QueuePositionUpdate(typed(kind, value)?),
        MessageKind::EmergencyStop => Payload::EmergencyStop(typed(kind, value)?),
        MessageKind::EmergencyStopAck => Payload::EmergencyStopAck(typed(kind, value)?),
        MessageKind::TokenRefresh => Payload::TokenRefresh(typed(kind, value)?),
        MessageKind::DashboardConnect => Payload::DashboardConnect(typed(kind, value)?),
        MessageKind::DashboardSubscribe => Payload::DashboardSubscribe(typed(kind, value)?),
        MessageKind::DashboardUnsubscribe => Payload::DashboardUnsubscribe(typed(kind, value)?),
        MessageKind::ServerStats => Payload::ServerStats(typed(kind, value)?),
        MessageKind::ServerStatsRequest => Payload::ServerStatsRequest,
        MessageKind::Ping => Payload::Ping(typed(kind, value)?),
        MessageKind::Pong => Payload::Pong(typed(kind, value)?),
        MessageKind::Error => Payload::Error(typed(kind, value)?),
    })
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
