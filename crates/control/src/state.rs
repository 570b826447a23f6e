// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::audit::{AuditSink, AuditStore, MemoryAuditStore};
use crate::auth::device::DeviceAuthStore;
use crate::auth::manager::TokenManager;
use crate::auth::verifier::TokenVerifier;
use crate::config::ControlConfig;
use crate::dispatch::Dispatcher;
use crate::fanout::Fanout;
use crate::pool::ConnectionPool;
use crate::heartbeat::HeartbeatManager;
use crate::stop::EmergencyStop;

/// Shared control-plane state, one instance per server.
pub struct ControlState {
    pub config: ControlConfig,
    pub pool: Arc<ConnectionPool>,
    pub heartbeat: Arc<HeartbeatManager>,
    pub verifier: Arc<TokenVerifier>,
    pub tokens: Arc<TokenManager>,
    pub device_auth: DeviceAuthStore,
    pub fanout: Arc<Fanout>,
    pub audit: Arc<AuditSink>,
    pub dispatcher: Arc<Dispatcher>,
    pub stop: EmergencyStop,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

impl ControlState {
    pub fn new(config: ControlConfig, shutdown: CancellationToken) -> anyhow::Result<Arc<Self>> {
        let pool = Arc::new(ConnectionPool::new());
        let heartbeat = HeartbeatManager::new(
            Arc::clone(&pool),
            config.missed_ping_threshold,
            config.pong_timeout(),
        );
        let verifier = Arc::new(TokenVerifier::new(
            config.signing_key.as_deref(),
            config.identity_url.clone(),
        )?);
        let tokens = TokenManager::new(
            Arc::clone(&verifier),
            config.token_threshold(),
            config.token_max_attempts,
        );
        let device_auth = DeviceAuthStore::new(Arc::clone(&verifier));
        let fanout = Arc::new(Fanout::new(config.fanout_buffer));
        let audit = AuditSink::new(
            Arc::new(MemoryAuditStore::new()) as Arc<dyn AuditStore>,
            config.audit_buffer,
            shutdown.clone(),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&pool),
            Arc::clone(&fanout),
            Arc::clone(&audit),
            config.clone(),
            shutdown.clone(),
        );
        let stop = EmergencyStop::new(Arc::clone(&dispatcher), Arc::clone(&audit), config.stop_window());

        Ok(Arc::new(Self {
            config,
            pool,
            heartbeat,
            verifier,
            tokens,
            device_auth,
            fanout,
            audit,
            dispatcher,
            stop,
            started_at: Instant::now(),
            shutdown,
        }))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
