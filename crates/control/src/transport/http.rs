// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP API: health, read models, audit queries, and the device-authorization
//! endpoints behind CLI sign-in.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::audit::{AuditKind, AuditQuery};
use crate::auth::device::PollOutcome;
use crate::auth::Identity;
use crate::error::ErrorCode;
use crate::state::ControlState;
use crate::transport::auth::extract_token;

/// Verify the caller's bearer token. Dashboards use the same tokens over
/// HTTP as over the socket.
async fn require_auth(state: &ControlState, headers: &HeaderMap) -> Result<Identity, Response> {
    let Some(token) = extract_token(headers, None) else {
        return Err(ErrorCode::AuthenticationFailed
            .to_http_response("missing bearer token")
            .into_response());
    };
    match state.verifier.verify(&token).await {
        Ok(verified) => Ok(verified.identity),
        Err(e) => Err(ErrorCode::AuthenticationFailed.to_http_response(e.to_string()).into_response()),
    }
}

/// `GET /api/v1/health` — liveness and basic counters. No auth.
pub async fn health(State(state): State<Arc<ControlState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "uptimeSecs": state.uptime_secs(),
        "connections": state.pool.len().await,
        "agents": state.dispatcher.connected_agent_count().await,
        "auditDroppedEvents": state.audit.dropped_events(),
    }))
}

/// `GET /api/v1/agents` — per-agent status, queue length, executing command.
pub async fn list_agents(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    Json(state.dispatcher.agents_snapshot().await).into_response()
}

/// `GET /api/v1/agents/{agent_id}/queue` — authoritative queue positions.
pub async fn agent_queue(
    State(state): State<Arc<ControlState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let Some(view) = state.dispatcher.agent_view(&agent_id).await else {
        return ErrorCode::AgentOffline
            .to_http_response(format!("unknown agent: {agent_id}"))
            .into_response();
    };
    let queue: Vec<serde_json::Value> = state
        .dispatcher
        .queue_snapshot(&agent_id)
        .await
        .into_iter()
        .map(|(command_id, position)| {
            serde_json::json!({"commandId": command_id, "queuePosition": position})
        })
        .collect();
    Json(serde_json::json!({
        "agentId": agent_id,
        "status": view.status,
        "executingCommandId": view.executing_command_id,
        "queue": queue,
    }))
    .into_response()
}

/// `GET /api/v1/connections/{connection_id}/health` — latency statistics.
pub async fn connection_health(
    State(state): State<Arc<ControlState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    match state.heartbeat.stats(&connection_id).await {
        Some(stats) => Json(stats).into_response(),
        None => ErrorCode::CommandNotFound
            .to_http_response(format!("unknown connection: {connection_id}"))
            .into_response(),
    }
}

/// Raw query parameters of `GET /audit-logs`.
#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    #[serde(rename = "eventType")]
    pub event_type: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "agentId")]
    pub agent_id: Option<String>,
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// `GET /audit-logs` — paginated audit query, newest first.
pub async fn audit_logs(
    State(state): State<Arc<ControlState>>,
    Query(params): Query<AuditLogQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }

    let kind = match params.event_type.as_deref() {
        Some(tag) => match AuditKind::parse(tag) {
            Some(kind) => Some(kind),
            None => {
                return ErrorCode::ValidationFailed
                    .to_http_response(format!("unknown eventType: {tag}"))
                    .into_response();
            }
        },
        None => None,
    };

    let query = match AuditQuery::validated(
        kind,
        params.user_id,
        params.agent_id,
        params.from,
        params.to,
        params.limit,
        params.offset,
    ) {
        Ok(query) => query,
        Err(code) => {
            return code.to_http_response("limit must be 1..=1000, offset >= 0").into_response();
        }
    };

    let events = state.audit.query(&query);
    let count = events.len();
    Json(serde_json::json!({ "events": events, "count": count })).into_response()
}

// -- Device authorization (CLI sign-in) ----------------------------------------

/// `POST /device/authorize` — begin a device-authorization grant.
pub async fn device_authorize(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
) -> Response {
    let base = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(|h| format!("http://{h}"))
        .unwrap_or_else(|| format!("http://{}:{}", state.config.host, state.config.port));
    Json(state.device_auth.authorize(&base).await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DeviceTokenBody {
    pub device_code: String,
}

/// `POST /device/token` — poll a device code for tokens.
pub async fn device_token(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<DeviceTokenBody>,
) -> Response {
    match state.device_auth.poll(&body.device_code).await {
        PollOutcome::Approved(tokens) => Json(tokens).into_response(),
        outcome => {
            let tag = outcome.error_tag().unwrap_or("invalid_request");
            (
                axum::http::StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": tag })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceApproveBody {
    pub user_code: String,
    pub token: String,
}

/// `POST /device/approve` — an authenticated operator approves a pending
/// device code.
pub async fn device_approve(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<DeviceApproveBody>,
) -> Response {
    let identity = match state.verifier.verify(&body.token).await {
        Ok(verified) => verified.identity,
        Err(e) => {
            return ErrorCode::AuthenticationFailed.to_http_response(e.to_string()).into_response();
        }
    };
    let approved = state.device_auth.approve(&body.user_code, identity.clone()).await;
    if approved {
        state.audit.append(
            AuditKind::AuthLogin,
            Some(&identity.user_id),
            None,
            None,
            serde_json::json!({"flow": "device", "userCode": body.user_code}),
        );
    }
    Json(serde_json::json!({ "approved": approved })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
}

/// `POST /cli/refresh` — rotate a refresh grant.
pub async fn cli_refresh(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<RefreshBody>,
) -> Response {
    match state.device_auth.refresh(&body.refresh_token).await {
        Some(tokens) => Json(tokens).into_response(),
        None => ErrorCode::AuthenticationFailed
            .to_http_response("unknown or revoked refresh token")
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ValidateBody {
    pub token: String,
}

/// `POST /cli/validate` — check a token without consuming anything.
pub async fn cli_validate(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<ValidateBody>,
) -> Response {
    match state.verifier.verify(&body.token).await {
        Ok(verified) => Json(serde_json::json!({
            "valid": true,
            "userId": verified.identity.user_id,
            "expiresAt": verified.expires_at,
        }))
        .into_response(),
        Err(_) => Json(serde_json::json!({ "valid": false })).into_response(),
    }
}

/// `POST /cli/revoke` — revoke a refresh grant. Idempotent.
pub async fn cli_revoke(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<RefreshBody>,
) -> Response {
    let revoked = state.device_auth.revoke(&body.refresh_token).await;
    Json(serde_json::json!({ "revoked": revoked })).into_response()
}
