// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The bidirectional channel. One long-lived WebSocket per client; the
//! reader routes decoded frames into the subsystems, a writer task drains
//! the connection's outbound queue.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::AuditKind;
use crate::dispatch::AgentInfo;
use crate::error::ErrorCode;
use crate::fanout::ClassSet;
use crate::pool::{AuthState, ConnectionEntry, RemoveReason, Role};
use crate::protocol::codec::{self, DecodeError};
use crate::protocol::{self, Envelope, Payload, PingPong, ServerStats};
use crate::rate::RateLimiter;
use crate::state::ControlState;
use crate::transport::auth::extract_token;

/// Query parameters accepted on upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    /// Comma-separated agent ids to subscribe to immediately, or `all`.
    pub agents: Option<String>,
    /// Comma-separated event classes (`status,command,terminal,trace,queue`).
    pub events: Option<String>,
}

/// `GET /ws` — upgrade for agents and dashboards.
pub async fn ws_handler(
    State(state): State<Arc<ControlState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = extract_token(&headers, query.token.as_deref());
    let remote_addr = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_owned();
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    ws.on_upgrade(move |socket| handle_socket(state, socket, token, query, remote_addr, user_agent))
}

/// Session-local view of who this connection turned out to be.
#[derive(Default)]
struct Session {
    role: Option<Role>,
    user_id: Option<String>,
    agent_id: Option<String>,
}

struct Ctx {
    state: Arc<ControlState>,
    entry: Arc<ConnectionEntry>,
    cancel: CancellationToken,
}

impl Ctx {
    fn send(&self, frame: String) {
        self.entry.send(frame);
    }

    fn send_error(&self, code: ErrorCode, message: &str, details: Option<serde_json::Value>) {
        self.send(protocol::encode_error(code, message, details));
    }
}

async fn handle_socket(
    state: Arc<ControlState>,
    socket: WebSocket,
    upgrade_token: Option<String>,
    query: WsQuery,
    remote_addr: String,
    user_agent: String,
) {
    let connection_id = Uuid::new_v4().to_string();
    let cancel = state.shutdown.child_token();
    let (entry, mut outbound_rx) =
        state.pool.add(connection_id.clone(), remote_addr, user_agent, cancel.clone()).await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drains the outbound queue until the socket or session dies.
    // Queued frames win over cancellation so a final error still ships.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = outbound_rx.recv() => match frame {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_cancel.cancelled() => break,
            }
        }
        while let Ok(text) = outbound_rx.try_recv() {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let ctx = Ctx { state: Arc::clone(&state), entry: Arc::clone(&entry), cancel: cancel.clone() };
    let mut session = Session::default();

    // A token attached to the upgrade authenticates the connection as a
    // dashboard up front. A bad one closes the socket.
    if let Some(token) = upgrade_token {
        if !authenticate_dashboard(&ctx, &mut session, &token, Some(&query)).await {
            finish(&state, &connection_id, cancel, writer).await;
            return;
        }
    }

    let mut limiter =
        RateLimiter::new(state.config.rate_limit_max, state.config.rate_limit_window());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    entry.touch(text.len());
                    if !limiter.check() {
                        ctx.send_error(
                            ErrorCode::RateLimitExceeded,
                            "message rate limit exceeded",
                            Some(serde_json::json!({
                                "maxMessages": state.config.rate_limit_max,
                                "windowMs": state.config.rate_limit_window_ms,
                            })),
                        );
                        continue;
                    }
                    match codec::decode(&text) {
                        Ok(envelope) => {
                            if !route(&ctx, &mut session, envelope).await {
                                break;
                            }
                        }
                        Err(DecodeError { code, message }) => {
                            ctx.send_error(code, &message, None);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            }
        }
    }

    finish(&state, &connection_id, cancel, writer).await;
}

/// Tear the connection down exactly once.
async fn finish(
    state: &Arc<ControlState>,
    connection_id: &str,
    cancel: CancellationToken,
    writer: tokio::task::JoinHandle<()>,
) {
    state.pool.remove(connection_id, RemoveReason::SocketClosed).await;
    cancel.cancel();
    let _ = writer.await;
}

/// Handle one decoded frame. Returns false when the connection must close.
async fn route(ctx: &Ctx, session: &mut Session, envelope: Envelope) -> bool {
    match envelope.payload {
        // -- Handshakes --------------------------------------------------------
        Payload::AgentConnect(p) => {
            if session.role.is_some() {
                ctx.send_error(ErrorCode::ValidationFailed, "already authenticated", None);
                return true;
            }
            authenticate_agent(ctx, session, p).await
        }
        Payload::DashboardConnect(p) => {
            if session.role.is_some() {
                ctx.send_error(ErrorCode::ValidationFailed, "already authenticated", None);
                return true;
            }
            let Some(token) = p.token else {
                ctx.send_error(ErrorCode::AuthenticationFailed, "token required", None);
                return false;
            };
            authenticate_dashboard(ctx, session, &token, None).await
        }

        // -- Keepalive ---------------------------------------------------------
        Payload::Ping(p) => {
            ctx.send(protocol::encode(&Payload::Pong(PingPong { timestamp: p.timestamp })));
            true
        }
        Payload::Pong(p) => {
            ctx.state.heartbeat.on_pong(&ctx.entry.id, p.timestamp).await;
            true
        }

        // -- Agent traffic -----------------------------------------------------
        Payload::AgentHeartbeat(p) => {
            let Some(agent_id) = require_agent(ctx, session) else { return true };
            if p.agent_id == agent_id {
                ctx.state.dispatcher.agent_heartbeat(&agent_id).await;
            }
            true
        }
        Payload::AgentError(p) => {
            let Some(agent_id) = require_agent(ctx, session) else { return true };
            if p.fatal.unwrap_or(false) {
                ctx.state.dispatcher.agent_fatal_error(&agent_id, &p.code, &p.message).await;
            } else {
                tracing::warn!(agent_id, code = %p.code, "agent error: {}", p.message);
            }
            true
        }
        Payload::CommandAck(p) => {
            let Some(agent_id) = require_agent(ctx, session) else { return true };
            ctx.state.dispatcher.agent_ack(&agent_id, &p).await;
            true
        }
        Payload::CommandComplete(p) => {
            let Some(agent_id) = require_agent(ctx, session) else { return true };
            ctx.state.dispatcher.command_complete(&agent_id, &p).await;
            true
        }
        Payload::TerminalOutput(p) => {
            let Some(agent_id) = require_agent(ctx, session) else { return true };
            if p.agent_id == agent_id {
                ctx.state.dispatcher.terminal_output(&agent_id, p).await;
            }
            true
        }
        Payload::TraceEvent(p) => {
            let Some(agent_id) = require_agent(ctx, session) else { return true };
            if p.agent_id == agent_id {
                ctx.state.dispatcher.trace_event(&agent_id, p).await;
            }
            true
        }

        // -- Dashboard traffic -------------------------------------------------
        Payload::CommandRequest(p) => {
            let Some(user_id) = require_dashboard(ctx, session) else { return true };
            match ctx.state.dispatcher.submit(&user_id, &ctx.entry.id, &p).await {
                Ok(ack) => {
                    ctx.send(protocol::encode(&Payload::CommandAck(protocol::CommandAck {
                        command_id: ack.command_id,
                        status: "QUEUED".to_owned(),
                        queue_position: Some(ack.queue_position),
                        estimated_start_time: Some(ack.estimated_start_time),
                    })));
                }
                Err(e) => ctx.send_error(e.code, &e.message, e.details),
            }
            true
        }
        Payload::CommandCancel(p) => {
            let Some(user_id) = require_dashboard(ctx, session) else { return true };
            if let Err(e) = ctx.state.dispatcher.cancel(&user_id, &p.command_id, &p.reason).await {
                ctx.send_error(e.code, &e.message, e.details);
            }
            true
        }
        Payload::EmergencyStop(p) => {
            let Some(user_id) = require_dashboard(ctx, session) else { return true };
            let outcome = ctx.state.stop.trigger(&user_id, &p.reason).await;
            ctx.send(protocol::encode(&Payload::EmergencyStopAck(protocol::EmergencyStopAck {
                agents_stopped: outcome.counts.agents_stopped,
                commands_cancelled: outcome.counts.commands_cancelled,
                repeated: outcome.repeated,
            })));
            true
        }
        Payload::DashboardSubscribe(p) => {
            if require_dashboard(ctx, session).is_none() {
                return true;
            }
            let classes = ClassSet::from_names(p.events.iter().map(String::as_str));
            ctx.state.fanout.subscribe(&ctx.entry.id, &p.agent_id, classes).await;
            true
        }
        Payload::DashboardUnsubscribe(p) => {
            if require_dashboard(ctx, session).is_none() {
                return true;
            }
            ctx.state.fanout.unsubscribe(&ctx.entry.id, &p.agent_id).await;
            true
        }
        Payload::ServerStatsRequest => {
            if require_dashboard(ctx, session).is_none() {
                return true;
            }
            let stats = ServerStats {
                connections: ctx.state.pool.len().await,
                agents: ctx.state.dispatcher.connected_agent_count().await,
                dashboards: ctx.state.pool.get_by_role(Role::Dashboard).await.len(),
                uptime_secs: ctx.state.uptime_secs(),
            };
            ctx.send(protocol::encode(&Payload::ServerStats(stats)));
            true
        }

        // -- Server-originated kinds are not accepted inbound ------------------
        Payload::AgentStatusUpdate(_)
        | Payload::CommandQuery(_)
        | Payload::CommandStatusUpdate(_)
        | Payload::QueuePositionUpdate(_)
        | Payload::EmergencyStopAck(_)
        | Payload::TokenRefresh(_)
        | Payload::ServerStats(_)
        | Payload::Error(_) => {
            ctx.send_error(
                ErrorCode::ValidationFailed,
                &format!("{} is not accepted from clients", envelope.kind),
                None,
            );
            true
        }
    }
}

/// Verify the agent handshake. Closes the connection on a bad token.
async fn authenticate_agent(
    ctx: &Ctx,
    session: &mut Session,
    p: protocol::AgentConnect,
) -> bool {
    let verified = match ctx.state.verifier.verify(&p.token).await {
        Ok(v) => v,
        Err(e) => {
            reject_auth(ctx, Some(&p.agent_id), e);
            return false;
        }
    };

    let auth = AuthState {
        role: Role::Agent,
        identity: verified.identity.clone(),
        agent_id: Some(p.agent_id.clone()),
    };
    if let Err(e) = ctx.state.pool.authenticate(&ctx.entry.id, auth).await {
        tracing::warn!(err = %e, "agent authentication race lost");
        ctx.send_error(ErrorCode::Internal, "authentication failed", None);
        return false;
    }

    session.role = Some(Role::Agent);
    session.user_id = Some(verified.identity.user_id.clone());
    session.agent_id = Some(p.agent_id.clone());

    ctx.state
        .tokens
        .track(&ctx.entry.id, p.token.clone(), None, verified.expires_at)
        .await;
    ctx.state.heartbeat.monitor(&ctx.entry.id, ctx.cancel.child_token()).await;
    ctx.state
        .dispatcher
        .agent_connected(
            &p.agent_id,
            &ctx.entry.id,
            AgentInfo {
                agent_type: p.agent_type,
                version: p.version,
                capabilities: p.capabilities,
                metadata: p.metadata,
            },
        )
        .await;
    ctx.state.audit.append(
        AuditKind::AuthLogin,
        Some(&verified.identity.user_id),
        Some(&p.agent_id),
        None,
        serde_json::json!({"role": "agent"}),
    );
    true
}

/// Verify a dashboard token (upgrade-time or `DASHBOARD_CONNECT`). Closes
/// the connection on a bad token.
async fn authenticate_dashboard(
    ctx: &Ctx,
    session: &mut Session,
    token: &str,
    query: Option<&WsQuery>,
) -> bool {
    let verified = match ctx.state.verifier.verify(token).await {
        Ok(v) => v,
        Err(e) => {
            reject_auth(ctx, None, e);
            return false;
        }
    };

    let auth = AuthState { role: Role::Dashboard, identity: verified.identity.clone(), agent_id: None };
    if let Err(e) = ctx.state.pool.authenticate(&ctx.entry.id, auth).await {
        tracing::warn!(err = %e, "dashboard authentication race lost");
        ctx.send_error(ErrorCode::Internal, "authentication failed", None);
        return false;
    }

    session.role = Some(Role::Dashboard);
    session.user_id = Some(verified.identity.user_id.clone());

    ctx.state
        .tokens
        .track(&ctx.entry.id, token.to_owned(), None, verified.expires_at)
        .await;
    ctx.state.heartbeat.monitor(&ctx.entry.id, ctx.cancel.child_token()).await;
    ctx.state.fanout.register(&ctx.entry).await;

    // Upgrade-time subscriptions.
    if let Some(query) = query {
        if let Some(ref agents) = query.agents {
            let classes = ClassSet::from_names(
                query.events.as_deref().unwrap_or("").split(','),
            );
            for agent in agents.split(',').map(str::trim).filter(|a| !a.is_empty()) {
                let agent = if agent == "all" { "*" } else { agent };
                ctx.state.fanout.subscribe(&ctx.entry.id, agent, classes).await;
            }
        }
    }

    ctx.state.audit.append(
        AuditKind::AuthLogin,
        Some(&verified.identity.user_id),
        None,
        None,
        serde_json::json!({"role": "dashboard"}),
    );
    true
}

fn reject_auth(ctx: &Ctx, agent_id: Option<&str>, err: crate::auth::verifier::VerifyError) {
    use crate::auth::verifier::VerifyError;
    let code = match err {
        VerifyError::Expired => ErrorCode::TokenExpired,
        VerifyError::Invalid => ErrorCode::AuthenticationFailed,
    };
    ctx.send_error(code, &err.to_string(), None);
    ctx.state.audit.append(
        AuditKind::SecurityAlert,
        None,
        agent_id,
        None,
        serde_json::json!({"event": "authentication failed", "reason": err.to_string()}),
    );
    tracing::warn!(connection_id = %ctx.entry.id, "authentication failed: {err}");
}

fn require_agent(ctx: &Ctx, session: &Session) -> Option<String> {
    match (session.role, session.agent_id.as_ref()) {
        (Some(Role::Agent), Some(agent_id)) => Some(agent_id.clone()),
        _ => {
            ctx.send_error(ErrorCode::Unauthorized, "agent connection required", None);
            None
        }
    }
}

fn require_dashboard(ctx: &Ctx, session: &Session) -> Option<String> {
    match (session.role, session.user_id.as_ref()) {
        (Some(Role::Dashboard), Some(user_id)) => Some(user_id.clone()),
        _ => {
            ctx.send_error(ErrorCode::Unauthorized, "dashboard connection required", None);
            None
        }
    }
}
