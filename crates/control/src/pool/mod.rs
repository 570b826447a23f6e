// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection pool: tracks every live socket's metadata, activity, and
//! authentication state. Sends are handed to a per-connection outbound
//! channel; no lock is held across a network write.

pub mod sweeper;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::auth::Identity;
use crate::protocol::epoch_ms;

/// Outbound frame queue depth per connection.
const OUTBOUND_CAPACITY: usize = 512;

/// Connection role, fixed at authentication time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Dashboard,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Dashboard => "dashboard",
        }
    }
}

/// Authentication state, set at most once per connection.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub role: Role,
    pub identity: Identity,
    /// Set for agent connections only.
    pub agent_id: Option<String>,
}

/// Why a connection was removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    SocketClosed,
    IdleTimeout,
    AuthTimeout,
    Administrative,
    Reauthenticate,
    Unhealthy,
}

impl RemoveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SocketClosed => "socket closed",
            Self::IdleTimeout => "idle timeout",
            Self::AuthTimeout => "authentication timeout",
            Self::Administrative => "administrative close",
            Self::Reauthenticate => "reauthenticate",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Pool lifecycle events, consumed by heartbeat, token, audit, and dispatch.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Added { connection_id: String },
    Authenticated { connection_id: String },
    /// `auth` is the state the connection held when it was removed, so
    /// consumers can tell agent sockets from dashboards without a lookup.
    Removed { connection_id: String, reason: RemoveReason, auth: Option<AuthState> },
}

/// One live socket.
pub struct ConnectionEntry {
    pub id: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub connected_at: Instant,
    /// Epoch millis of the last inbound frame.
    pub last_activity_ms: AtomicU64,
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub auth: RwLock<Option<AuthState>>,
    /// Outbound frames; the connection's writer task drains this.
    sender: mpsc::Sender<String>,
    pub cancel: CancellationToken,
}

impl ConnectionEntry {
    pub fn touch(&self, bytes: usize) {
        self.last_activity_ms.store(epoch_ms(), Ordering::Relaxed);
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Queue a frame for the writer task. Returns false when the frame was
    /// dropped (queue full or writer gone); the caller leaves the entry for
    /// the sweeper.
    pub fn send(&self, frame: String) -> bool {
        let len = frame.len() as u64;
        match self.sender.try_send(frame) {
            Ok(()) => {
                self.messages_out.fetch_add(1, Ordering::Relaxed);
                self.bytes_out.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %self.id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.cancel.cancel();
                false
            }
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.auth.read().await.is_some()
    }
}

/// The pool. One record per live socket.
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, Arc<ConnectionEntry>>>,
    event_tx: broadcast::Sender<PoolEvent>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self { connections: RwLock::new(HashMap::new()), event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.event_tx.subscribe()
    }

    /// Register a freshly accepted socket. Returns the entry and the
    /// receiving half of its outbound queue, which the caller's writer task
    /// must drain.
    pub async fn add(
        &self,
        id: String,
        remote_addr: String,
        user_agent: String,
        cancel: CancellationToken,
    ) -> (Arc<ConnectionEntry>, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        let entry = Arc::new(ConnectionEntry {
            id: id.clone(),
            remote_addr,
            user_agent,
            connected_at: Instant::now(),
            last_activity_ms: AtomicU64::new(epoch_ms()),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            auth: RwLock::new(None),
            sender,
            cancel,
        });
        self.connections.write().await.insert(id.clone(), Arc::clone(&entry));
        let _ = self.event_tx.send(PoolEvent::Added { connection_id: id });
        (entry, receiver)
    }

    /// Mark a connection authenticated. The transition happens at most once;
    /// a second attempt is rejected.
    ///
    /// For agents, any older connection already authenticated under the same
    /// agent id is administratively closed first.
    pub async fn authenticate(&self, id: &str, auth: AuthState) -> anyhow::Result<()> {
        // Evict an older connection for the same agent id before marking the
        // new one authenticated.
        if let (Role::Agent, Some(agent_id)) = (auth.role, auth.agent_id.as_deref()) {
            if let Some(older) = self.get_by_agent(agent_id).await {
                if older.id != id {
                    tracing::info!(
                        agent_id,
                        old = %older.id,
                        new = %id,
                        "duplicate agent connection, closing older"
                    );
                    self.remove(&older.id, RemoveReason::Administrative).await;
                }
            }
        }

        let entry = self
            .get(id)
            .await
            .ok_or_else(|| anyhow::anyhow!("connection not found: {id}"))?;
        {
            let mut guard = entry.auth.write().await;
            if guard.is_some() {
                anyhow::bail!("connection already authenticated: {id}");
            }
            *guard = Some(auth);
        }
        let _ = self.event_tx.send(PoolEvent::Authenticated { connection_id: id.to_owned() });
        Ok(())
    }

    /// Remove a connection, cancel its tasks, and emit `Removed`. Removal
    /// happens exactly once; later calls are no-ops.
    pub async fn remove(&self, id: &str, reason: RemoveReason) -> Option<Arc<ConnectionEntry>> {
        let entry = self.connections.write().await.remove(id)?;
        entry.cancel.cancel();
        let auth = entry.auth.read().await.clone();
        let _ = self
            .event_tx
            .send(PoolEvent::Removed { connection_id: id.to_owned(), reason, auth });
        tracing::debug!(connection_id = %id, reason = reason.as_str(), "connection removed");
        Some(entry)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ConnectionEntry>> {
        self.connections.read().await.get(id).map(Arc::clone)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// All authenticated connections with the given role.
    pub async fn get_by_role(&self, role: Role) -> Vec<Arc<ConnectionEntry>> {
        let mut out = Vec::new();
        for entry in self.snapshot().await {
            let auth = entry.auth.read().await;
            if auth.as_ref().is_some_and(|a| a.role == role) {
                drop(auth);
                out.push(entry);
            }
        }
        out
    }

    /// The authenticated connection for an agent id, if any.
    pub async fn get_by_agent(&self, agent_id: &str) -> Option<Arc<ConnectionEntry>> {
        for entry in self.snapshot().await {
            let auth = entry.auth.read().await;
            if auth.as_ref().is_some_and(|a| a.agent_id.as_deref() == Some(agent_id)) {
                drop(auth);
                return Some(entry);
            }
        }
        None
    }

    /// All authenticated connections belonging to a user.
    pub async fn get_by_user(&self, user_id: &str) -> Vec<Arc<ConnectionEntry>> {
        let mut out = Vec::new();
        for entry in self.snapshot().await {
            let auth = entry.auth.read().await;
            if auth.as_ref().is_some_and(|a| a.identity.user_id == user_id) {
                drop(auth);
                out.push(entry);
            }
        }
        out
    }

    /// All authenticated connections.
    pub async fn authenticated(&self) -> Vec<Arc<ConnectionEntry>> {
        let mut out = Vec::new();
        for entry in self.snapshot().await {
            if entry.is_authenticated().await {
                out.push(entry);
            }
        }
        out
    }

    /// Queue a frame to one connection.
    pub async fn send_to(&self, id: &str, frame: String) -> bool {
        match self.get(id).await {
            Some(entry) => entry.send(frame),
            None => false,
        }
    }

    /// Queue a frame to every authenticated connection accepted by `filter`.
    /// A failed send is noted and left for the sweeper; the broadcast
    /// continues. Returns the number of successful sends.
    pub async fn broadcast<F>(&self, filter: F, frame: &str) -> usize
    where
        F: Fn(&AuthState) -> bool,
    {
        let mut targets = Vec::new();
        for entry in self.snapshot().await {
            let auth = entry.auth.read().await;
            if auth.as_ref().is_some_and(&filter) {
                drop(auth);
                targets.push(entry);
            }
        }

        let mut delivered = 0;
        for entry in targets {
            if entry.send(frame.to_owned()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Snapshot of every entry, for sweepers and stats.
    pub async fn snapshot(&self) -> Vec<Arc<ConnectionEntry>> {
        self.connections.read().await.values().map(Arc::clone).collect()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
