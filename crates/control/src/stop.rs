// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Emergency-stop controller: system-wide cancellation with an idempotency
//! window so a double-click does not double-report.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::audit::{AuditKind, AuditSink};
use crate::dispatch::{Dispatcher, StopCounts};

/// Outcome reported to the triggering dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub counts: StopCounts,
    /// True when the call landed inside the idempotency window of an
    /// earlier stop and did nothing.
    pub repeated: bool,
}

pub struct EmergencyStop {
    dispatcher: Arc<Dispatcher>,
    audit: Arc<AuditSink>,
    window: Duration,
    last: Mutex<Option<(tokio::time::Instant, StopCounts)>>,
}

impl EmergencyStop {
    pub fn new(dispatcher: Arc<Dispatcher>, audit: Arc<AuditSink>, window: Duration) -> Self {
        Self { dispatcher, audit, window, last: Mutex::new(None) }
    }

    /// Trigger a stop. Holding the `last` lock across the cancellation
    /// serializes concurrent triggers: the second caller waits, then sees
    /// the first's timestamp and becomes a no-op.
    pub async fn trigger(&self, actor_user_id: &str, reason: &str) -> StopOutcome {
        let mut last = self.last.lock().await;
        let now = tokio::time::Instant::now();
        if let Some((at, counts)) = *last {
            if now.duration_since(at) < self.window {
                tracing::info!(actor_user_id, "emergency stop repeated within window, no-op");
                return StopOutcome { counts, repeated: true };
            }
        }

        let counts = self.dispatcher.cancel_all(reason).await;
        *last = Some((now, counts));

        self.audit.append(
            AuditKind::EmergencyStopTriggered,
            Some(actor_user_id),
            None,
            None,
            serde_json::json!({
                "reason": reason,
                "agentsStopped": counts.agents_stopped,
                "commandsCancelled": counts.commands_cancelled,
            }),
        );
        tracing::warn!(
            actor_user_id,
            agents = counts.agents_stopped,
            commands = counts.commands_cancelled,
            "emergency stop triggered"
        );
        StopOutcome { counts, repeated: false }
    }
}

#[cfg(test)]
#[path = "stop_tests.rs"]
mod tests;
