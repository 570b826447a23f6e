// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the control plane.

pub mod auth;
pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::ControlState;

/// Build the axum `Router` with all control-plane routes.
pub fn build_router(state: Arc<ControlState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Read models
        .route("/api/v1/agents", get(http::list_agents))
        .route("/api/v1/agents/{agent_id}/queue", get(http::agent_queue))
        .route("/api/v1/connections/{connection_id}/health", get(http::connection_health))
        // Audit query
        .route("/audit-logs", get(http::audit_logs))
        // CLI sign-in: device authorization grant
        .route("/device/authorize", post(http::device_authorize))
        .route("/device/token", post(http::device_token))
        .route("/device/approve", post(http::device_approve))
        .route("/cli/refresh", post(http::cli_refresh))
        .route("/cli/validate", post(http::cli_validate))
        .route("/cli/revoke", post(http::cli_revoke))
        // The bidirectional channel for agents and dashboards
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
