// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the control-plane HTTP API.
//!
//! Uses `axum_test::TestServer` — no real TCP needed.

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use tokio_util::sync::CancellationToken;

use droverd::config::ControlConfig;
use droverd::state::ControlState;
use droverd::transport::build_router;

fn test_config() -> ControlConfig {
    ControlConfig {
        host: "127.0.0.1".into(),
        port: 0,
        signing_key: None,
        identity_url: None,
        ping_interval_ms: 30_000,
        pong_timeout_ms: 10_000,
        missed_ping_threshold: 3,
        sweep_interval_ms: 30_000,
        idle_timeout_ms: 1_800_000,
        auth_timeout_ms: 60_000,
        token_cycle_ms: 60_000,
        token_threshold_ms: 300_000,
        token_max_attempts: 3,
        max_queue_size: 5,
        queue_step_secs: 30,
        command_timeout_ms: 300_000,
        grace_window_ms: 60_000,
        stop_window_ms: 5_000,
        cancel_kill_ms: 5_000,
        fanout_buffer: 256,
        rate_limit_max: 100,
        rate_limit_window_ms: 60_000,
        audit_buffer: 1024,
        protocol_version: 1,
    }
}

fn test_state() -> Arc<ControlState> {
    ControlState::new(test_config(), CancellationToken::new()).expect("failed to build state")
}

fn test_server(state: Arc<ControlState>) -> TestServer {
    TestServer::new(build_router(state)).expect("failed to create test server")
}

fn bearer(token: &str) -> axum::http::HeaderValue {
    axum::http::HeaderValue::from_str(&format!("Bearer {token}")).expect("valid header value")
}

fn operator_token(state: &ControlState) -> String {
    let identity = droverd::auth::Identity {
        user_id: "operator".into(),
        email: None,
        role: Some("operator".into()),
    };
    state.verifier.mint(&identity, Duration::from_secs(3600)).0
}

#[tokio::test]
async fn health_is_open_and_reports_counters() {
    let server = test_server(test_state());
    let resp = server.get("/api/v1/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "running");
    assert_eq!(body["connections"], 0);
    assert_eq!(body["agents"], 0);
    assert_eq!(body["auditDroppedEvents"], 0);
}

#[tokio::test]
async fn agents_listing_requires_auth() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));

    let resp = server.get("/api/v1/agents").await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    let token = operator_token(&state);
    let resp = server
        .get("/api/v1/agents")
        .add_header(axum::http::header::AUTHORIZATION, bearer(&token))
        .await;
    resp.assert_status_ok();
    let agents: Vec<serde_json::Value> = resp.json();
    assert!(agents.is_empty());
}

#[tokio::test]
async fn audit_logs_validate_parameters() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let token = operator_token(&state);

    let resp = server
        .get("/audit-logs")
        .add_query_param("limit", "0")
        .add_header(axum::http::header::AUTHORIZATION, bearer(&token))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);

    let resp = server
        .get("/audit-logs")
        .add_query_param("limit", "1001")
        .add_header(axum::http::header::AUTHORIZATION, bearer(&token))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);

    let resp = server
        .get("/audit-logs")
        .add_query_param("eventType", "NOT_A_TAG")
        .add_header(axum::http::header::AUTHORIZATION, bearer(&token))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);

    let resp = server
        .get("/audit-logs")
        .add_query_param("eventType", "AUTH_LOGIN")
        .add_query_param("limit", "10")
        .add_header(axum::http::header::AUTHORIZATION, bearer(&token))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn device_flow_end_to_end() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let operator = operator_token(&state);

    // 1. CLI asks for a device code.
    let resp = server.post("/device/authorize").await;
    resp.assert_status_ok();
    let auth: serde_json::Value = resp.json();
    let device_code = auth["device_code"].as_str().expect("device_code");
    let user_code = auth["user_code"].as_str().expect("user_code");
    assert_eq!(auth["interval"], 5);

    // 2. Polling before approval is pending.
    let resp = server
        .post("/device/token")
        .json(&serde_json::json!({"device_code": device_code}))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"], "authorization_pending");

    // 3. An authenticated operator approves.
    let resp = server
        .post("/device/approve")
        .json(&serde_json::json!({"user_code": user_code, "token": operator}))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["approved"], true);

    // 4. An immediate re-poll is throttled, not granted.
    let resp = server
        .post("/device/token")
        .json(&serde_json::json!({"device_code": device_code}))
        .await;
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"], "slow_down");
}

#[tokio::test]
async fn cli_validate_and_revoke() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let token = operator_token(&state);

    let resp = server
        .post("/cli/validate")
        .json(&serde_json::json!({"token": token}))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["valid"], true);
    assert_eq!(body["userId"], "operator");

    let resp = server
        .post("/cli/validate")
        .json(&serde_json::json!({"token": "garbage"}))
        .await;
    let body: serde_json::Value = resp.json();
    assert_eq!(body["valid"], false);

    // Revoking an unknown refresh grant is a harmless no-op.
    let resp = server
        .post("/cli/revoke")
        .json(&serde_json::json!({"refresh_token": "unknown"}))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["revoked"], false);
}

#[tokio::test]
async fn unknown_agent_queue_is_rejected() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let token = operator_token(&state);

    let resp = server
        .get("/api/v1/agents/ghost/queue")
        .add_header(axum::http::header::AUTHORIZATION, bearer(&token))
        .await;
    resp.assert_status(axum::http::StatusCode::CONFLICT);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "AGENT_OFFLINE");
}
