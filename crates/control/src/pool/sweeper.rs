// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic reaper for idle, unauthenticated, and dead connections.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ControlConfig;
use crate::pool::{ConnectionPool, RemoveReason};
use crate::protocol::epoch_ms;

/// Spawn the pool sweeper.
pub fn spawn_sweeper(pool: Arc<ConnectionPool>, config: ControlConfig, shutdown: CancellationToken) {
    let interval = config.sweep_interval();
    let idle_ms = config.idle_timeout_ms;
    let auth_ms = config.auth_timeout_ms;

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            sweep_once(&pool, idle_ms, auth_ms).await;
        }
    });
}

/// One sweep over the pool. Exposed for tests.
pub async fn sweep_once(pool: &ConnectionPool, idle_ms: u64, auth_ms: u64) {
    let now = epoch_ms();

    for entry in pool.snapshot().await {
        // Sockets already gone.
        if entry.cancel.is_cancelled() {
            pool.remove(&entry.id, RemoveReason::SocketClosed).await;
            continue;
        }

        let last = entry.last_activity_ms.load(Ordering::Relaxed);
        let idle_for = now.saturating_sub(last);

        if entry.is_authenticated().await {
            if idle_for > idle_ms {
                tracing::info!(connection_id = %entry.id, idle_for, "reaping idle connection");
                pool.remove(&entry.id, RemoveReason::IdleTimeout).await;
            }
        } else {
            let age = entry.connected_at.elapsed().as_millis() as u64;
            if age > auth_ms {
                tracing::info!(connection_id = %entry.id, age, "reaping unauthenticated connection");
                pool.remove(&entry.id, RemoveReason::AuthTimeout).await;
            }
        }
    }
}
