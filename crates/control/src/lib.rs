// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Drover: control plane for a fleet of long-running AI agent processes.
//!
//! One server multiplexes agents (workers that execute commands and stream
//! terminal output) and dashboards (operators that submit, observe, and
//! cancel work) over persistent WebSocket channels.

pub mod audit;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod heartbeat;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod rate;
pub mod state;
pub mod stop;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditKind;
use crate::auth::manager::TokenEvent;
use crate::config::ControlConfig;
use crate::error::ErrorCode;
use crate::heartbeat::HealthEvent;
use crate::pool::{PoolEvent, RemoveReason};
use crate::protocol::Payload;
use crate::state::ControlState;
use crate::transport::build_router;

/// Run the control plane until `shutdown` fires.
pub async fn run(config: ControlConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    config.validate()?;
    let addr = format!("{}:{}", config.host, config.port);

    let state = ControlState::new(config.clone(), shutdown.clone())?;

    pool::sweeper::spawn_sweeper(Arc::clone(&state.pool), config.clone(), shutdown.clone());
    heartbeat::spawn_heartbeat(Arc::clone(&state.heartbeat), config.ping_interval(), shutdown.clone());
    auth::manager::spawn_refresh_loop(Arc::clone(&state.tokens), config.token_cycle(), shutdown.clone());
    spawn_supervisor(Arc::clone(&state));

    tracing::info!("droverd listening on {addr}");
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}

/// Bridge subsystem events: pool removals fan into every interested
/// subsystem, token events become `TOKEN_REFRESH` frames or closes, health
/// degradation reaches the dispatcher.
pub fn spawn_supervisor(state: Arc<ControlState>) {
    let mut pool_rx = state.pool.subscribe();
    let mut token_rx = state.tokens.subscribe();
    let mut health_rx = state.heartbeat.subscribe();
    let shutdown = state.shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = pool_rx.recv() => {
                    let event = match event {
                        Ok(e) => e,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "supervisor lagged on pool events");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    if let PoolEvent::Removed { connection_id, auth, .. } = event {
                        state.heartbeat.unmonitor(&connection_id).await;
                        state.tokens.untrack(&connection_id).await;
                        state.fanout.remove(&connection_id).await;
                        if let Some(agent_id) = auth.and_then(|a| a.agent_id) {
                            state.dispatcher.agent_disconnected(&agent_id, &connection_id).await;
                        }
                    }
                }

                event = token_rx.recv() => {
                    let event = match event {
                        Ok(e) => e,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    match event {
                        TokenEvent::Updated { connection_id, access_token, expires_in, refresh_token } => {
                            let frame = protocol::encode(&Payload::TokenRefresh(protocol::TokenRefresh {
                                access_token,
                                expires_in,
                                refresh_token,
                            }));
                            state.pool.send_to(&connection_id, frame).await;
                            state.audit.append(
                                AuditKind::AuthTokenRefresh,
                                None,
                                None,
                                None,
                                serde_json::json!({"connectionId": connection_id}),
                            );
                        }
                        TokenEvent::RefreshFailed { connection_id } => {
                            let frame = protocol::encode_error(
                                ErrorCode::TokenExpired,
                                "reauthenticate",
                                None,
                            );
                            state.pool.send_to(&connection_id, frame).await;
                            state.pool.remove(&connection_id, RemoveReason::Reauthenticate).await;
                        }
                    }
                }

                event = health_rx.recv() => {
                    let event = match event {
                        Ok(e) => e,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    let HealthEvent::ConnectionUnhealthy { connection_id } = event;
                    state.dispatcher.connection_unhealthy(&connection_id).await;
                }
            }
        }
    });
}
