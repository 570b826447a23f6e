// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Unified error codes shared by WebSocket `ERROR` frames and the HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidMessageFormat,
    UnsupportedMessageType,
    MessageTooLarge,
    RateLimitExceeded,
    AuthenticationFailed,
    Unauthorized,
    TokenExpired,
    QueueFull,
    CommandNotFound,
    AgentOffline,
    AgentBusy,
    CommandTimeout,
    CommandCancelled,
    ValidationFailed,
    Internal,
    ServiceUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessageFormat => "INVALID_MESSAGE_FORMAT",
            Self::UnsupportedMessageType => "UNSUPPORTED_MESSAGE_TYPE",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::QueueFull => "QUEUE_FULL",
            Self::CommandNotFound => "COMMAND_NOT_FOUND",
            Self::AgentOffline => "AGENT_OFFLINE",
            Self::AgentBusy => "AGENT_BUSY",
            Self::CommandTimeout => "COMMAND_TIMEOUT",
            Self::CommandCancelled => "COMMAND_CANCELLED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Internal => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidMessageFormat => 400,
            Self::UnsupportedMessageType => 400,
            Self::MessageTooLarge => 413,
            Self::RateLimitExceeded => 429,
            Self::AuthenticationFailed => 401,
            Self::Unauthorized => 403,
            Self::TokenExpired => 401,
            Self::QueueFull => 409,
            Self::CommandNotFound => 404,
            Self::AgentOffline => 409,
            Self::AgentBusy => 409,
            Self::CommandTimeout => 408,
            Self::CommandCancelled => 409,
            Self::ValidationFailed => 400,
            Self::Internal => 500,
            Self::ServiceUnavailable => 503,
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into(), details: None }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope for HTTP endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
///
/// `details` carries structured context (e.g. `maxQueueSize` on `QUEUE_FULL`);
/// internals such as backtraces or datastore errors are never placed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
