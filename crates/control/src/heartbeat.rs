// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Heartbeat manager: periodic pings, pong bookkeeping, latency statistics,
//! and unhealthy detection for every authenticated connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionPool;
use crate::protocol::{self, epoch_ms, Payload, PingPong};

/// Latency samples retained per connection.
const RING_CAPACITY: usize = 10;

/// Fixed-capacity ring of round-trip latency samples.
///
/// Statistics are computed from a stack copy of the ring; no per-sample
/// allocation happens on the hot path.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyRing {
    samples: [u64; RING_CAPACITY],
    len: usize,
    pos: usize,
}

impl LatencyRing {
    pub fn push(&mut self, latency_ms: u64) {
        self.samples[self.pos] = latency_ms;
        self.pos = (self.pos + 1) % RING_CAPACITY;
        self.len = (self.len + 1).min(RING_CAPACITY);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn average(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        let sum: u64 = self.samples[..self.len].iter().sum();
        sum as f64 / self.len as f64
    }

    /// Sorted stack copy of the live samples.
    fn sorted(&self) -> ([u64; RING_CAPACITY], usize) {
        let mut copy = self.samples;
        // Insertion sort over at most ten elements.
        for i in 1..self.len {
            let mut j = i;
            while j > 0 && copy[j - 1] > copy[j] {
                copy.swap(j - 1, j);
                j -= 1;
            }
        }
        (copy, self.len)
    }

    /// Nearest-rank percentile. `p` in 0..=100.
    pub fn percentile(&self, p: u8) -> u64 {
        if self.len == 0 {
            return 0;
        }
        let (sorted, len) = self.sorted();
        let rank = ((p as usize * len).div_ceil(100)).clamp(1, len);
        sorted[rank - 1]
    }

    pub fn min(&self) -> u64 {
        if self.len == 0 {
            return 0;
        }
        self.samples[..self.len].iter().copied().min().unwrap_or(0)
    }

    pub fn max(&self) -> u64 {
        self.samples[..self.len].iter().copied().max().unwrap_or(0)
    }
}

/// Health bookkeeping for one monitored connection.
#[derive(Debug)]
pub struct HealthRecord {
    pub last_ping_sent_ms: u64,
    pub last_pong_ms: u64,
    pub missed_pings: u32,
    pub ring: LatencyRing,
    pub healthy: bool,
    cancel: CancellationToken,
}

/// Latency statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    pub healthy: bool,
    pub missed_pings: u32,
    pub avg_latency_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// Missed pings crossed the threshold; executing commands on this
    /// connection should be failed as agent timeouts.
    ConnectionUnhealthy { connection_id: String },
}

/// Sends pings and tracks pongs for monitored connections.
pub struct HeartbeatManager {
    records: RwLock<HashMap<String, HealthRecord>>,
    pool: Arc<ConnectionPool>,
    event_tx: broadcast::Sender<HealthEvent>,
    threshold: u32,
    pong_timeout: Duration,
}

impl HeartbeatManager {
    pub fn new(pool: Arc<ConnectionPool>, threshold: u32, pong_timeout: Duration) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            pool,
            event_tx,
            threshold,
            pong_timeout,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }

    /// Begin monitoring a connection. `cancel` should be a child of the
    /// connection's token so pending pong watchers die with the socket.
    pub async fn monitor(&self, connection_id: &str, cancel: CancellationToken) {
        let record = HealthRecord {
            last_ping_sent_ms: 0,
            last_pong_ms: 0,
            missed_pings: 0,
            ring: LatencyRing::default(),
            healthy: true,
            cancel,
        };
        self.records.write().await.insert(connection_id.to_owned(), record);
    }

    /// Stop monitoring and cancel pending watchers.
    pub async fn unmonitor(&self, connection_id: &str) {
        if let Some(rec) = self.records.write().await.remove(connection_id) {
            rec.cancel.cancel();
        }
    }

    pub async fn stats(&self, connection_id: &str) -> Option<HealthStats> {
        let records = self.records.read().await;
        let rec = records.get(connection_id)?;
        Some(HealthStats {
            healthy: rec.healthy,
            missed_pings: rec.missed_pings,
            avg_latency_ms: rec.ring.average(),
            p50_ms: rec.ring.percentile(50),
            p95_ms: rec.ring.percentile(95),
            p99_ms: rec.ring.percentile(99),
            min_ms: rec.ring.min(),
            max_ms: rec.ring.max(),
        })
    }

    pub async fn is_healthy(&self, connection_id: &str) -> bool {
        self.records.read().await.get(connection_id).is_none_or(|r| r.healthy)
    }

    /// One ping round over every monitored connection.
    pub async fn tick(self: &Arc<Self>) {
        let now = epoch_ms();
        let targets: Vec<(String, CancellationToken)> = {
            let mut records = self.records.write().await;
            let mut unhealthy = Vec::new();
            let targets = records
                .iter_mut()
                .map(|(id, rec)| {
                    rec.last_ping_sent_ms = now;
                    rec.missed_pings += 1;
                    if rec.missed_pings >= self.threshold && rec.healthy {
                        rec.healthy = false;
                        unhealthy.push(id.clone());
                    }
                    (id.clone(), rec.cancel.clone())
                })
                .collect();
            drop(records);
            for id in unhealthy {
                self.declare_unhealthy(&id);
            }
            targets
        };

        for (id, cancel) in targets {
            let frame = protocol::encode(&Payload::Ping(PingPong { timestamp: now }));
            self.pool.send_to(&id, frame).await;

            // Per-ping pong watcher.
            let manager = Arc::clone(self);
            let conn_id = id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(manager.pong_timeout) => {
                        manager.check_pong_timeout(&conn_id, now).await;
                    }
                }
            });
        }
    }

    /// Record a pong carrying the echoed ping timestamp.
    pub async fn on_pong(&self, connection_id: &str, echoed_ts: u64) {
        let mut records = self.records.write().await;
        let Some(rec) = records.get_mut(connection_id) else { return };

        let now = epoch_ms();
        rec.last_pong_ms = now;
        rec.ring.push(now.saturating_sub(echoed_ts));
        rec.missed_pings = rec.missed_pings.saturating_sub(1);
        if rec.missed_pings < self.threshold {
            rec.healthy = true;
        }
    }

    /// Pong-timeout check for the ping sent at `ping_ts`.
    async fn check_pong_timeout(&self, connection_id: &str, ping_ts: u64) {
        let degraded = {
            let mut records = self.records.write().await;
            let Some(rec) = records.get_mut(connection_id) else { return };
            if rec.last_pong_ms >= ping_ts {
                return;
            }
            if rec.missed_pings >= self.threshold && rec.healthy {
                rec.healthy = false;
                true
            } else {
                false
            }
        };
        if degraded {
            self.declare_unhealthy(connection_id);
        }
    }

    fn declare_unhealthy(&self, connection_id: &str) {
        tracing::warn!(connection_id, "connection unhealthy: missed ping threshold reached");
        let _ = self
            .event_tx
            .send(HealthEvent::ConnectionUnhealthy { connection_id: connection_id.to_owned() });
    }
}

/// Spawn the periodic ping loop.
pub fn spawn_heartbeat(
    manager: Arc<HeartbeatManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            manager.tick().await;
        }
    });
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
