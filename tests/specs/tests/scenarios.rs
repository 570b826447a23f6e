// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenario tests that spawn the real `droverd` binary and drive
//! it with WebSocket agents and dashboards.

use std::time::Duration;

use drover_specs::{mint_token, DroverProcess, WsClient};

const TIMEOUT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(300);

async fn submit(
    dash: &mut WsClient,
    agent_id: &str,
    content: &str,
    priority: i64,
) -> anyhow::Result<serde_json::Value> {
    dash.send(
        "COMMAND_REQUEST",
        serde_json::json!({"agentId": agent_id, "content": content, "priority": priority}),
    )
    .await?;
    let ack = dash.expect("COMMAND_ACK", TIMEOUT).await?;
    Ok(ack["payload"].clone())
}

async fn ack_executing(agent: &mut WsClient, command_id: &str) -> anyhow::Result<()> {
    agent
        .send(
            "COMMAND_ACK",
            serde_json::json!({"commandId": command_id, "status": "EXECUTING"}),
        )
        .await
}

// -- S1: queue positions -------------------------------------------------------

#[tokio::test]
async fn s1_queue_positions() -> anyhow::Result<()> {
    let server = DroverProcess::start(&[])?;
    server.wait_healthy(TIMEOUT).await?;

    let mut agent = WsClient::connect_agent(&server, "A1").await?;
    let mut dash = WsClient::connect_dashboard(&server, "operator").await?;

    let c1 = submit(&mut dash, "A1", "one", 1).await?;
    let c2 = submit(&mut dash, "A1", "two", 1).await?;
    let c3 = submit(&mut dash, "A1", "three", 1).await?;

    assert_eq!(c1["status"], "QUEUED");
    assert_eq!(c1["queuePosition"], 1);
    assert_eq!(c2["queuePosition"], 2);
    assert_eq!(c3["queuePosition"], 3);

    // The agent received the head; acking it re-indexes the rest.
    let req = agent.expect("COMMAND_REQUEST", TIMEOUT).await?;
    assert_eq!(req["payload"]["commandId"], c1["commandId"]);
    ack_executing(&mut agent, c1["commandId"].as_str().unwrap_or_default()).await?;

    let updates = dash.collect("QUEUE_POSITION_UPDATE", QUIET).await?;
    let positions: Vec<(String, u64)> = updates
        .iter()
        .map(|f| {
            (
                f["payload"]["commandId"].as_str().unwrap_or_default().to_owned(),
                f["payload"]["queuePosition"].as_u64().unwrap_or_default(),
            )
        })
        .collect();
    let c2_id = c2["commandId"].as_str().unwrap_or_default().to_owned();
    let c3_id = c3["commandId"].as_str().unwrap_or_default().to_owned();
    assert!(positions.contains(&(c2_id, 1)), "positions: {positions:?}");
    assert!(positions.contains(&(c3_id, 2)), "positions: {positions:?}");
    Ok(())
}

// -- S2: priority preemption ---------------------------------------------------

#[tokio::test]
async fn s2_priority_preemption() -> anyhow::Result<()> {
    let server = DroverProcess::start(&[])?;
    server.wait_healthy(TIMEOUT).await?;

    let mut agent = WsClient::connect_agent(&server, "A1").await?;
    let mut dash = WsClient::connect_dashboard(&server, "operator").await?;

    // Low-priority command starts executing on the idle agent.
    let low = submit(&mut dash, "A1", "low", 1).await?;
    let req = agent.expect("COMMAND_REQUEST", TIMEOUT).await?;
    assert_eq!(req["payload"]["commandId"], low["commandId"]);
    let low_id = low["commandId"].as_str().unwrap_or_default().to_owned();
    ack_executing(&mut agent, &low_id).await?;

    // High priority queues at position 1 behind the running low.
    let high = submit(&mut dash, "A1", "high", 10).await?;
    assert_eq!(high["queuePosition"], 1);
    let high_id = high["commandId"].as_str().unwrap_or_default().to_owned();

    // Cancel low; the agent is told and confirms; high promotes.
    dash.send(
        "COMMAND_CANCEL",
        serde_json::json!({"commandId": low_id, "reason": "user"}),
    )
    .await?;
    let cancel = agent.expect("COMMAND_CANCEL", TIMEOUT).await?;
    assert_eq!(cancel["payload"]["commandId"], low_id.as_str());
    agent
        .send(
            "COMMAND_COMPLETE",
            serde_json::json!({
                "commandId": low_id,
                "status": "CANCELLED",
                "duration": 10,
                "startedAt": 1,
                "completedAt": 11,
            }),
        )
        .await?;

    let req = agent.expect("COMMAND_REQUEST", TIMEOUT).await?;
    assert_eq!(req["payload"]["commandId"], high_id.as_str(), "high promotes after cancel");
    Ok(())
}

// -- S3: cancel queued ---------------------------------------------------------

#[tokio::test]
async fn s3_cancel_queued_command() -> anyhow::Result<()> {
    let server = DroverProcess::start(&[])?;
    server.wait_healthy(TIMEOUT).await?;

    let mut agent = WsClient::connect_agent(&server, "A1").await?;
    let mut dash = WsClient::connect_dashboard(&server, "operator").await?;

    let c1 = submit(&mut dash, "A1", "one", 1).await?;
    let c1_id = c1["commandId"].as_str().unwrap_or_default().to_owned();
    agent.expect("COMMAND_REQUEST", TIMEOUT).await?;
    ack_executing(&mut agent, &c1_id).await?;

    let c2 = submit(&mut dash, "A1", "two", 1).await?;
    let c2_id = c2["commandId"].as_str().unwrap_or_default().to_owned();

    dash.send(
        "COMMAND_CANCEL",
        serde_json::json!({"commandId": c2_id, "reason": "user"}),
    )
    .await?;

    // Exactly one cancelled status for C2.
    let updates = dash.collect("COMMAND_STATUS_UPDATE", QUIET).await?;
    let cancelled: Vec<_> = updates
        .iter()
        .filter(|f| {
            f["payload"]["commandId"] == c2_id.as_str() && f["payload"]["status"] == "CANCELLED"
        })
        .collect();
    assert_eq!(cancelled.len(), 1, "updates: {updates:?}");

    // C2 no longer appears in queue queries.
    let token = mint_token("operator", Duration::from_secs(600))?;
    let queue: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/api/v1/agents/A1/queue", server.base_url()))
        .bearer_auth(&token)
        .send()
        .await?
        .json()
        .await?;
    let ids: Vec<&str> = queue["queue"]
        .as_array()
        .map(|items| items.iter().filter_map(|i| i["commandId"].as_str()).collect())
        .unwrap_or_default();
    assert!(!ids.contains(&c2_id.as_str()), "queue: {queue}");
    Ok(())
}

// -- S4: queue full ------------------------------------------------------------

#[tokio::test]
async fn s4_queue_full_after_five() -> anyhow::Result<()> {
    let server = DroverProcess::start(&[])?;
    server.wait_healthy(TIMEOUT).await?;

    // The agent never acks, so every submission stays queued.
    let _agent = WsClient::connect_agent(&server, "A1").await?;
    let mut dash = WsClient::connect_dashboard(&server, "operator").await?;

    for expected in 1..=5u64 {
        let ack = submit(&mut dash, "A1", "cmd", 1).await?;
        assert_eq!(ack["status"], "QUEUED");
        assert_eq!(ack["queuePosition"], expected);
    }

    for _ in 0..2 {
        dash.send(
            "COMMAND_REQUEST",
            serde_json::json!({"agentId": "A1", "content": "overflow", "priority": 1}),
        )
        .await?;
        let err = dash.expect("ERROR", TIMEOUT).await?;
        assert_eq!(err["payload"]["code"], "QUEUE_FULL");
        assert_eq!(err["payload"]["details"]["maxQueueSize"], 5);
    }
    Ok(())
}

// -- S5: emergency stop --------------------------------------------------------

#[tokio::test]
async fn s5_emergency_stop() -> anyhow::Result<()> {
    let server = DroverProcess::start(&[])?;
    server.wait_healthy(TIMEOUT).await?;

    let mut a1 = WsClient::connect_agent(&server, "A1").await?;
    let mut a2 = WsClient::connect_agent(&server, "A2").await?;
    let mut dash = WsClient::connect_dashboard(&server, "operator").await?;

    // Each agent: one executing, one queued.
    for (agent, name) in [(&mut a1, "A1"), (&mut a2, "A2")] {
        let run = submit(&mut dash, name, "run", 1).await?;
        agent.expect("COMMAND_REQUEST", TIMEOUT).await?;
        ack_executing(agent, run["commandId"].as_str().unwrap_or_default()).await?;
        submit(&mut dash, name, "wait", 1).await?;
    }

    dash.send("EMERGENCY_STOP", serde_json::json!({"reason": "drill"})).await?;
    let ack = dash.expect("EMERGENCY_STOP_ACK", TIMEOUT).await?;
    assert_eq!(ack["payload"]["agentsStopped"], 2);
    assert_eq!(ack["payload"]["commandsCancelled"], 4);
    assert_eq!(ack["payload"]["repeated"], false);

    // Both agents receive cancels for their executing commands.
    a1.expect("COMMAND_CANCEL", TIMEOUT).await?;
    a2.expect("COMMAND_CANCEL", TIMEOUT).await?;

    // A second stop inside the window is a no-op with the same counts.
    dash.send("EMERGENCY_STOP", serde_json::json!({"reason": "drill"})).await?;
    let ack = dash.expect("EMERGENCY_STOP_ACK", TIMEOUT).await?;
    assert_eq!(ack["payload"]["repeated"], true);
    assert_eq!(ack["payload"]["commandsCancelled"], 4);

    // One audit event carrying the counts of the first invocation.
    let token = mint_token("operator", Duration::from_secs(600))?;
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let body: serde_json::Value = client
            .get(format!(
                "{}/audit-logs?eventType=EMERGENCY_STOP_TRIGGERED",
                server.base_url()
            ))
            .bearer_auth(&token)
            .send()
            .await?
            .json()
            .await?;
        if body["count"] == 1 {
            let event = &body["events"][0];
            assert_eq!(event["details"]["agentsStopped"], 2);
            assert_eq!(event["details"]["commandsCancelled"], 4);
            break;
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "audit event never appeared: {body}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

// -- S6: token rotation without disconnect -------------------------------------

#[tokio::test]
async fn s6_token_rotation_keeps_socket_alive() -> anyhow::Result<()> {
    // Refresh cycle every 300 ms so the test observes a rotation quickly.
    let server = DroverProcess::start(&[("DROVER_TOKEN_CYCLE_MS", "300")])?;
    server.wait_healthy(TIMEOUT).await?;

    // Token expires in 2 minutes; the renewal threshold is 5 — due now.
    let token = mint_token("operator", Duration::from_secs(120))?;
    let mut dash = WsClient::connect(&server, &format!("?token={token}&agents=all")).await?;

    let refresh = dash.expect("TOKEN_REFRESH", TIMEOUT).await?;
    let rotated = refresh["payload"]["accessToken"].as_str().unwrap_or_default();
    assert!(!rotated.is_empty());
    assert_ne!(rotated, token, "a replacement token, not an echo");
    assert!(refresh["payload"]["expiresIn"].as_u64().unwrap_or_default() > 120);

    // The socket survived the rotation and still answers.
    dash.send("PING", serde_json::json!({"timestamp": 7})).await?;
    let pong = dash.expect("PONG", TIMEOUT).await?;
    assert_eq!(pong["payload"]["timestamp"], 7);

    // The rotated token is genuine: the validate endpoint accepts it.
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/cli/validate", server.base_url()))
        .json(&serde_json::json!({"token": rotated}))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["valid"], true);
    assert_eq!(body["userId"], "operator");
    Ok(())
}

// -- Exit codes ----------------------------------------------------------------

#[tokio::test]
async fn unsupported_protocol_version_exits_64() -> anyhow::Result<()> {
    drover_specs::ensure_crypto();
    let binary = drover_specs::droverd_binary();
    anyhow::ensure!(binary.exists(), "droverd binary not found");

    let output = std::process::Command::new(&binary)
        .args(["--protocol-version", "99", "--port", "0"])
        .output()?;
    assert_eq!(output.status.code(), Some(64));
    Ok(())
}

#[tokio::test]
async fn invalid_config_exits_2() -> anyhow::Result<()> {
    drover_specs::ensure_crypto();
    let binary = drover_specs::droverd_binary();
    anyhow::ensure!(binary.exists(), "droverd binary not found");

    // Pong timeout must be shorter than the ping interval.
    let output = std::process::Command::new(&binary)
        .args(["--ping-interval-ms", "1000", "--pong-timeout-ms", "5000", "--port", "0"])
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    Ok(())
}
