// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection token lifecycle.
//!
//! A refresh cycle runs on a fixed period: records expired for over an hour
//! are dropped, and records inside the renewal threshold are refreshed in
//! place so the socket never has to reconnect. Renewals run in small batches
//! with gaps between them to avoid thundering the identity service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::auth::verifier::TokenVerifier;
use crate::auth::epoch_secs;

/// Records expired for longer than this are swept out of the map.
const EXPIRED_RETENTION_SECS: u64 = 3600;
/// Concurrent renewals per batch.
const REFRESH_BATCH: usize = 5;
/// Gap between batches.
const BATCH_GAP: Duration = Duration::from_millis(100);

/// Token state for one monitored connection.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Expiry, epoch seconds.
    pub expires_at: u64,
    /// Last successful refresh, epoch seconds. Zero before the first.
    pub last_refresh: u64,
    pub attempts: u32,
    pub in_progress: bool,
    pub failed: bool,
}

/// Events emitted by the token manager.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// A record was renewed; the replacement should be pushed to the client.
    Updated { connection_id: String, access_token: String, expires_in: u64, refresh_token: Option<String> },
    /// Renewal failed permanently; the connection must re-authenticate.
    RefreshFailed { connection_id: String },
}

/// Manages token freshness for every monitored connection.
pub struct TokenManager {
    records: RwLock<HashMap<String, TokenRecord>>,
    verifier: Arc<TokenVerifier>,
    event_tx: broadcast::Sender<TokenEvent>,
    threshold: Duration,
    max_attempts: u32,
}

impl TokenManager {
    pub fn new(verifier: Arc<TokenVerifier>, threshold: Duration, max_attempts: u32) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            verifier,
            event_tx,
            threshold,
            max_attempts,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.event_tx.subscribe()
    }

    /// Start monitoring a connection's token.
    pub async fn track(
        &self,
        connection_id: &str,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: u64,
    ) {
        let record = TokenRecord {
            access_token,
            refresh_token,
            expires_at,
            last_refresh: 0,
            attempts: 0,
            in_progress: false,
            failed: false,
        };
        self.records.write().await.insert(connection_id.to_owned(), record);
    }

    /// Stop monitoring a connection (socket closed).
    pub async fn untrack(&self, connection_id: &str) {
        self.records.write().await.remove(connection_id);
    }

    pub async fn get(&self, connection_id: &str) -> Option<TokenRecord> {
        self.records.read().await.get(connection_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// One refresh cycle: sweep long-expired records, renew records inside
    /// the threshold. Called periodically; safe to call concurrently since
    /// per-record `in_progress` flags prevent overlapping renewals.
    pub async fn run_cycle(&self) {
        let now = epoch_secs();

        // Sweep records that have been expired for over an hour.
        let due: Vec<String> = {
            let mut records = self.records.write().await;
            records.retain(|id, rec| {
                let stale = rec.expires_at + EXPIRED_RETENTION_SECS <= now;
                if stale {
                    tracing::debug!(connection_id = %id, "dropping long-expired token record");
                }
                !stale
            });

            records
                .iter_mut()
                .filter(|(_, rec)| {
                    !rec.failed
                        && !rec.in_progress
                        && rec.expires_at <= now + self.threshold.as_secs()
                })
                .map(|(id, rec)| {
                    rec.in_progress = true;
                    id.clone()
                })
                .collect()
        };

        if due.is_empty() {
            return;
        }
        tracing::debug!(count = due.len(), "token records due for renewal");

        for batch in due.chunks(REFRESH_BATCH) {
            let mut handles = Vec::with_capacity(batch.len());
            for id in batch {
                handles.push(self.refresh_one(id));
            }
            futures_util::future::join_all(handles).await;

            if batch.len() == REFRESH_BATCH {
                tokio::time::sleep(BATCH_GAP).await;
            }
        }
    }

    /// Renew one record. The caller has already set `in_progress`.
    async fn refresh_one(&self, connection_id: &str) {
        let (access, refresh) = {
            let records = self.records.read().await;
            match records.get(connection_id) {
                Some(rec) => (rec.access_token.clone(), rec.refresh_token.clone()),
                None => return,
            }
        };

        let outcome = self.verifier.refresh(&access, refresh.as_deref()).await;

        let mut records = self.records.write().await;
        let Some(rec) = records.get_mut(connection_id) else { return };
        rec.in_progress = false;

        match outcome {
            Ok((token, expires_at, new_refresh)) => {
                rec.access_token = token.clone();
                rec.expires_at = expires_at;
                // A rotated refresh token replaces the old one; the local
                // issuer returns none and the existing grant stays valid.
                if let Some(refresh) = new_refresh {
                    rec.refresh_token = Some(refresh);
                }
                rec.last_refresh = epoch_secs();
                rec.attempts = 0;
                let _ = self.event_tx.send(TokenEvent::Updated {
                    connection_id: connection_id.to_owned(),
                    access_token: token,
                    expires_in: expires_at.saturating_sub(epoch_secs()),
                    refresh_token: rec.refresh_token.clone(),
                });
            }
            Err(e) => {
                rec.attempts += 1;
                tracing::warn!(
                    connection_id,
                    attempts = rec.attempts,
                    err = %e,
                    "token refresh failed"
                );
                if rec.attempts >= self.max_attempts {
                    rec.failed = true;
                    let _ = self.event_tx.send(TokenEvent::RefreshFailed {
                        connection_id: connection_id.to_owned(),
                    });
                }
            }
        }
    }
}

/// Spawn the periodic refresh loop.
pub fn spawn_refresh_loop(manager: Arc<TokenManager>, cycle: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(cycle);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh server does
        // not renew tokens it just issued.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            manager.run_cycle().await;
        }
    });
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
