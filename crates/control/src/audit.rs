// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Audit sink: a total-order stream of security- and lifecycle-relevant
//! events. Appends go through a bounded channel drained by a writer task so
//! the hot path never blocks; overflow is counted, not waited on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorCode;
use crate::protocol::epoch_ms;

/// Events older than this are not returned by queries.
const RETENTION_MS: u64 = 30 * 24 * 3600 * 1000;
/// Upper bound on query page size.
const MAX_PAGE_SIZE: usize = 1000;
/// In-memory store cap; the oldest events fall off first.
const STORE_CAPACITY: usize = 100_000;

/// Fixed audit event tag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    AuthLogin,
    AuthTokenRefresh,
    AgentConnected,
    AgentDisconnected,
    CommandExecuted,
    CommandCompleted,
    CommandFailed,
    CommandCancelled,
    SecurityAlert,
    EmergencyStopTriggered,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthLogin => "AUTH_LOGIN",
            Self::AuthTokenRefresh => "AUTH_TOKEN_REFRESH",
            Self::AgentConnected => "AGENT_CONNECTED",
            Self::AgentDisconnected => "AGENT_DISCONNECTED",
            Self::CommandExecuted => "COMMAND_EXECUTED",
            Self::CommandCompleted => "COMMAND_COMPLETED",
            Self::CommandFailed => "COMMAND_FAILED",
            Self::CommandCancelled => "COMMAND_CANCELLED",
            Self::SecurityAlert => "SECURITY_ALERT",
            Self::EmergencyStopTriggered => "EMERGENCY_STOP_TRIGGERED",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(tag.to_owned())).ok()
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: u64,
}

/// Validated query parameters.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub kind: Option<AuditKind>,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    /// Inclusive lower bound, epoch millis.
    pub from: Option<u64>,
    /// Inclusive upper bound, epoch millis.
    pub to: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

impl AuditQuery {
    /// Validate raw pagination parameters. `limit` must be 1..=1000.
    pub fn validated(
        kind: Option<AuditKind>,
        user_id: Option<String>,
        agent_id: Option<String>,
        from: Option<u64>,
        to: Option<u64>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Self, ErrorCode> {
        let limit = limit.unwrap_or(100);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(ErrorCode::ValidationFailed);
        }
        Ok(Self { kind, user_id, agent_id, from, to, limit, offset: offset.unwrap_or(0) })
    }
}

/// Append/read interface of the durable datastore. The in-memory store is
/// the default; a persistent backend implements the same trait.
pub trait AuditStore: Send + Sync {
    fn append(&self, event: AuditEvent);
    /// Matching events, newest first, retention and pagination applied.
    fn query(&self, query: &AuditQuery) -> Vec<AuditEvent>;
}

/// Bounded in-memory store.
pub struct MemoryAuditStore {
    events: std::sync::RwLock<VecDeque<AuditEvent>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self { events: std::sync::RwLock::new(VecDeque::new()) }
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, event: AuditEvent) {
        let Ok(mut events) = self.events.write() else { return };
        if events.len() >= STORE_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }

    fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let cutoff = epoch_ms().saturating_sub(RETENTION_MS);
        let Ok(events) = self.events.read() else { return Vec::new() };

        // Newest first; append order is creation order.
        events
            .iter()
            .rev()
            .filter(|e| e.created_at >= cutoff)
            .filter(|e| query.kind.is_none_or(|k| e.kind == k))
            .filter(|e| {
                query.user_id.as_deref().is_none_or(|u| e.user_id.as_deref() == Some(u))
            })
            .filter(|e| {
                query.agent_id.as_deref().is_none_or(|a| e.agent_id.as_deref() == Some(a))
            })
            .filter(|e| query.from.is_none_or(|f| e.created_at >= f))
            .filter(|e| query.to.is_none_or(|t| e.created_at <= t))
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect()
    }
}

/// The audit sink: non-blocking append, buffered write-behind.
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
    store: Arc<dyn AuditStore>,
    dropped: AtomicU64,
}

impl AuditSink {
    /// Build the sink and spawn its writer task.
    pub fn new(
        store: Arc<dyn AuditStore>,
        buffer: usize,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(buffer.max(1));
        let writer_store = Arc::clone(&store);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => writer_store.append(event),
                        None => break,
                    }
                }
            }
            // Drain whatever is still queued on shutdown.
            while let Ok(event) = rx.try_recv() {
                writer_store.append(event);
            }
        });
        Arc::new(Self { tx, store, dropped: AtomicU64::new(0) })
    }

    /// Append an event. Never blocks; overflow is counted as dropped.
    pub fn append(
        &self,
        kind: AuditKind,
        user_id: Option<&str>,
        agent_id: Option<&str>,
        command_id: Option<&str>,
        details: serde_json::Value,
    ) {
        let event = AuditEvent {
            kind,
            user_id: user_id.map(str::to_owned),
            agent_id: agent_id.map(str::to_owned),
            command_id: command_id.map(str::to_owned),
            details,
            created_at: epoch_ms(),
        };
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped because the append buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        self.store.query(query)
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
