// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-format types for the control-plane channel.
//!
//! Every frame is a JSON envelope `{type, id, timestamp, payload}`. Kind
//! names are fixed and case-sensitive; payload fields are camelCase. The
//! codec in [`crate::protocol::codec`] is the only place raw text becomes
//! these types — internal code never sees untyped JSON.

pub mod codec;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

static MSG_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Next server-assigned envelope id. Monotonic across the process.
pub fn next_msg_id() -> String {
    format!("msg-{}", MSG_COUNTER.fetch_add(1, Ordering::Relaxed))
}

// -- Message kinds -------------------------------------------------------------

/// Fixed set of frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    AgentConnect,
    AgentHeartbeat,
    AgentError,
    AgentStatusUpdate,
    CommandRequest,
    CommandAck,
    CommandCancel,
    CommandComplete,
    CommandQuery,
    CommandStatusUpdate,
    TerminalOutput,
    TraceEvent,
    QueuePositionUpdate,
    EmergencyStop,
    EmergencyStopAck,
    TokenRefresh,
    DashboardConnect,
    DashboardSubscribe,
    DashboardUnsubscribe,
    ServerStats,
    ServerStatsRequest,
    Ping,
    Pong,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentConnect => "AGENT_CONNECT",
            Self::AgentHeartbeat => "AGENT_HEARTBEAT",
            Self::AgentError => "AGENT_ERROR",
            Self::AgentStatusUpdate => "AGENT_STATUS_UPDATE",
            Self::CommandRequest => "COMMAND_REQUEST",
            Self::CommandAck => "COMMAND_ACK",
            Self::CommandCancel => "COMMAND_CANCEL",
            Self::CommandComplete => "COMMAND_COMPLETE",
            Self::CommandQuery => "COMMAND_QUERY",
            Self::CommandStatusUpdate => "COMMAND_STATUS_UPDATE",
            Self::TerminalOutput => "TERMINAL_OUTPUT",
            Self::TraceEvent => "TRACE_EVENT",
            Self::QueuePositionUpdate => "QUEUE_POSITION_UPDATE",
            Self::EmergencyStop => "EMERGENCY_STOP",
            Self::EmergencyStopAck => "EMERGENCY_STOP_ACK",
            Self::TokenRefresh => "TOKEN_REFRESH",
            Self::DashboardConnect => "DASHBOARD_CONNECT",
            Self::DashboardSubscribe => "DASHBOARD_SUBSCRIBE",
            Self::DashboardUnsubscribe => "DASHBOARD_UNSUBSCRIBE",
            Self::ServerStats => "SERVER_STATS",
            Self::ServerStatsRequest => "SERVER_STATS_REQUEST",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Error => "ERROR",
        }
    }

    /// Parse a wire type tag. Case-sensitive.
    pub fn parse(tag: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(tag.to_owned())).ok()
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Payloads ------------------------------------------------------------------

/// Agent handshake. First frame on an agent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnect {
    pub agent_id: String,
    pub token: String,
    pub version: String,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHeartbeat {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<bool>,
}

/// Derived agent status pushed to subscribed dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusUpdate {
    pub agent_id: String,
    pub status: String,
    pub queued_commands: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executing_command_id: Option<String>,
}

/// Optional per-command execution constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConstraints {
    /// Time limit in milliseconds. Overrides the server default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
}

/// Command submission (dashboard → server) or forwarding (server → agent).
///
/// Dashboard-originated requests must name the target agent; the server
/// assigns the command id, ignoring any client-proposed one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub content: String,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_constraints: Option<ExecutionConstraints>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub command_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_start_time: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCancel {
    pub command_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandComplete {
    pub command_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration: u64,
    pub started_at: u64,
    pub completed_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Asks a reconnecting agent whether it can resume the command that was in
/// flight when its previous socket dropped. Answered with `COMMAND_ACK` to
/// resume or `COMMAND_COMPLETE` if it already finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandQuery {
    pub command_id: String,
}

/// Command lifecycle update pushed to subscribed dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusUpdate {
    pub command_id: String,
    pub agent_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Output stream discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    pub command_id: String,
    pub agent_id: String,
    pub output: String,
    pub stream: StreamKind,
    pub sequence: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub command_id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePositionUpdate {
    pub command_id: String,
    pub queue_position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStop {
    pub reason: String,
}

/// Acknowledgement of an `EMERGENCY_STOP` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopAck {
    pub agents_stopped: usize,
    pub commands_cancelled: usize,
    /// True when the request landed inside the idempotency window of an
    /// earlier stop and had no additional effect.
    pub repeated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefresh {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Explicit dashboard handshake for clients that could not attach a token
/// to the upgrade request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardConnect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSubscribe {
    /// Target agent id, or `"*"` for all agents.
    pub agent_id: String,
    /// Event names: `status`, `command`, `terminal`, `trace`, `queue`.
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardUnsubscribe {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub connections: usize,
    pub agents: usize,
    pub dashboards: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPong {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// -- Typed payload union -------------------------------------------------------

/// A decoded payload, one variant per [`MessageKind`].
#[derive(Debug, Clone)]
pub enum Payload {
    AgentConnect(AgentConnect),
    AgentHeartbeat(AgentHeartbeat),
    AgentError(AgentError),
    AgentStatusUpdate(AgentStatusUpdate),
    CommandRequest(CommandRequest),
    CommandAck(CommandAck),
    CommandCancel(CommandCancel),
    CommandComplete(CommandComplete),
    CommandQuery(CommandQuery),
    CommandStatusUpdate(CommandStatusUpdate),
    TerminalOutput(TerminalOutput),
    TraceEvent(TraceEvent),
    QueuePositionUpdate(QueuePositionUpdate),
    EmergencyStop(EmergencyStop),
    EmergencyStopAck(EmergencyStopAck),
    TokenRefresh(TokenRefresh),
    DashboardConnect(DashboardConnect),
    DashboardSubscribe(DashboardSubscribe),
    DashboardUnsubscribe(DashboardUnsubscribe),
    ServerStats(ServerStats),
    ServerStatsRequest,
    Ping(PingPong),
    Pong(PingPong),
    Error(WireError),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::AgentConnect(_) => MessageKind::AgentConnect,
            Self::AgentHeartbeat(_) => MessageKind::AgentHeartbeat,
            Self::AgentError(_) => MessageKind::AgentError,
            Self::AgentStatusUpdate(_) => MessageKind::AgentStatusUpdate,
            Self::CommandRequest(_) => MessageKind::CommandRequest,
            Self::CommandAck(_) => MessageKind::CommandAck,
            Self::CommandCancel(_) => MessageKind::CommandCancel,
            Self::CommandComplete(_) => MessageKind::CommandComplete,
            Self::CommandQuery(_) => MessageKind::CommandQuery,
            Self::CommandStatusUpdate(_) => MessageKind::CommandStatusUpdate,
            Self::TerminalOutput(_) => MessageKind::TerminalOutput,
            Self::TraceEvent(_) => MessageKind::TraceEvent,
            Self::QueuePositionUpdate(_) => MessageKind::QueuePositionUpdate,
            Self::EmergencyStop(_) => MessageKind::EmergencyStop,
            Self::EmergencyStopAck(_) => MessageKind::EmergencyStopAck,
            Self::TokenRefresh(_) => MessageKind::TokenRefresh,
            Self::DashboardConnect(_) => MessageKind::DashboardConnect,
            Self::DashboardSubscribe(_) => MessageKind::DashboardSubscribe,
            Self::DashboardUnsubscribe(_) => MessageKind::DashboardUnsubscribe,
            Self::ServerStats(_) => MessageKind::ServerStats,
            Self::ServerStatsRequest => MessageKind::ServerStatsRequest,
            Self::Ping(_) => MessageKind::Ping,
            Self::Pong(_) => MessageKind::Pong,
            Self::Error(_) => MessageKind::Error,
        }
    }

    fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::AgentConnect(p) => serde_json::to_value(p),
            Self::AgentHeartbeat(p) => serde_json::to_value(p),
            Self::AgentError(p) => serde_json::to_value(p),
            Self::AgentStatusUpdate(p) => serde_json::to_value(p),
            Self::CommandRequest(p) => serde_json::to_value(p),
            Self::CommandAck(p) => serde_json::to_value(p),
            Self::CommandCancel(p) => serde_json::to_value(p),
            Self::CommandComplete(p) => serde_json::to_value(p),
            Self::CommandQuery(p) => serde_json::to_value(p),
            Self::CommandStatusUpdate(p) => serde_json::to_value(p),
            Self::TerminalOutput(p) => serde_json::to_value(p),
            Self::TraceEvent(p) => serde_json::to_value(p),
            Self::QueuePositionUpdate(p) => serde_json::to_value(p),
            Self::EmergencyStop(p) => serde_json::to_value(p),
            Self::EmergencyStopAck(p) => serde_json::to_value(p),
            Self::TokenRefresh(p) => serde_json::to_value(p),
            Self::DashboardConnect(p) => serde_json::to_value(p),
            Self::DashboardSubscribe(p) => serde_json::to_value(p),
            Self::DashboardUnsubscribe(p) => serde_json::to_value(p),
            Self::ServerStats(p) => serde_json::to_value(p),
            Self::ServerStatsRequest => Ok(serde_json::json!({})),
            Self::Ping(p) => serde_json::to_value(p),
            Self::Pong(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
        }
    }
}

// -- Envelope ------------------------------------------------------------------

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: MessageKind,
    pub id: String,
    pub timestamp: u64,
    pub payload: Payload,
}

/// Serialize an outbound frame with a fresh server-assigned envelope.
pub fn encode(payload: &Payload) -> String {
    let body = serde_json::json!({
        "type": payload.kind().as_str(),
        "id": next_msg_id(),
        "timestamp": epoch_ms(),
        "payload": payload.payload_json().unwrap_or(serde_json::Value::Null),
    });
    body.to_string()
}

/// Serialize an `ERROR` frame from an [`crate::error::ErrorCode`].
pub fn encode_error(
    code: crate::error::ErrorCode,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> String {
    encode(&Payload::Error(WireError {
        code: code.as_str().to_owned(),
        message: message.into(),
        details,
    }))
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
