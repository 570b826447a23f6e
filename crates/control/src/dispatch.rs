// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command dispatcher: binds queued commands to agent sockets and drives the
//! command state machine.
//!
//! A submitted command is queued and acked with its 1-indexed position. When
//! the agent is idle the head is forwarded; it keeps its queue position
//! until the agent acknowledges it, at which point it moves into the
//! executing slot and everything behind it is re-indexed.
//!
//! All agent tables live behind one lock. Mutations collect their outbound
//! frames while holding it and send only after release — no lock is ever
//! held across a send. Grace-window expiry and reconnect race through the
//! same lock; an epoch counter on each entry decides which side wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditKind, AuditSink};
use crate::config::ControlConfig;
use crate::error::ErrorCode;
use crate::fanout::{EventClass, Fanout};
use crate::pool::ConnectionPool;
use crate::protocol::{
    self, epoch_ms, AgentStatusUpdate, CommandAck, CommandCancel, CommandComplete,
    CommandQuery, CommandRequest, CommandStatusUpdate, Payload, QueuePositionUpdate,
    TerminalOutput, TraceEvent,
};
use crate::queue::{estimated_start_ms, Command, CommandQueue, CommandStatus};

/// How long a reconnecting agent has to answer a `COMMAND_QUERY` before the
/// interrupted command is failed.
const RESUME_WINDOW: Duration = Duration::from_secs(10);

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Offline,
    Online,
    Executing,
    Error,
    Maintenance,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Executing => "executing",
            Self::Error => "error",
            Self::Maintenance => "maintenance",
        }
    }
}

/// Facts an agent declares at connect time.
#[derive(Debug, Clone, Default)]
pub struct AgentInfo {
    pub agent_type: Option<String>,
    pub version: String,
    pub capabilities: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A command forwarded to the agent, awaiting its acknowledgement. The
/// command itself still sits at the head of the queue.
#[derive(Debug)]
struct Dispatched {
    command_id: String,
    epoch: u64,
}

/// The command occupying an agent's executing slot.
#[derive(Debug)]
struct Executing {
    command: Command,
    started_at_ms: u64,
    /// Next terminal-output sequence number. Starts at 1.
    seq: u64,
    cancel_requested: bool,
    /// Set while a reconnected agent is being asked, via `COMMAND_QUERY`,
    /// whether it can resume this command.
    awaiting_resume: bool,
    /// Guards watchdogs against acting on a later command.
    epoch: u64,
}

struct AgentEntry {
    agent_id: String,
    connection_id: Option<String>,
    status: AgentStatus,
    info: AgentInfo,
    last_ping_ms: u64,
    queue: CommandQueue,
    dispatched: Option<Dispatched>,
    executing: Option<Executing>,
    /// Bumped on every connect/disconnect; stale grace timers see a
    /// mismatch and stand down.
    grace_epoch: u64,
    /// Bumped on every dispatch.
    exec_epoch: u64,
}

impl AgentEntry {
    fn idle_and_connected(&self) -> bool {
        self.connection_id.is_some()
            && self.executing.is_none()
            && self.dispatched.is_none()
            && matches!(self.status, AgentStatus::Online | AgentStatus::Executing)
    }

    fn accepts_work(&self) -> bool {
        // Offline entries still accept submissions while their grace window
        // holds work for a possible reconnect.
        self.connection_id.is_some()
            || self.executing.is_some()
            || !self.queue.is_empty()
            || self.dispatched.is_some()
    }
}

/// Read-model view of one agent, served by the HTTP API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    pub agent_id: String,
    pub status: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub queued_commands: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executing_command_id: Option<String>,
    pub last_ping_ms: u64,
}

/// A frame to deliver after the agent-table lock is released.
enum Outgoing {
    ToConnection { connection_id: String, frame: String },
    ToSubscribers { agent_id: String, class: EventClass, frame: String, exclude: Option<String> },
}

/// Result of an accepted submission.
#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub command_id: String,
    pub queue_position: usize,
    pub estimated_start_time: u64,
}

/// A refused submission or cancellation.
#[derive(Debug, Clone)]
pub struct DispatchError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl DispatchError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }
}

/// Counts reported by an emergency stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopCounts {
    pub agents_stopped: usize,
    pub commands_cancelled: usize,
}

pub struct Dispatcher {
    agents: RwLock<HashMap<String, AgentEntry>>,
    pool: Arc<ConnectionPool>,
    fanout: Arc<Fanout>,
    audit: Arc<AuditSink>,
    config: ControlConfig,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<ConnectionPool>,
        fanout: Arc<Fanout>,
        audit: Arc<AuditSink>,
        config: ControlConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            agents: RwLock::new(HashMap::new()),
            pool,
            fanout,
            audit,
            config,
            shutdown,
        })
    }

    // -- Agent lifecycle -------------------------------------------------------

    /// An agent authenticated on `connection_id`.
    pub async fn agent_connected(
        self: &Arc<Self>,
        agent_id: &str,
        connection_id: &str,
        info: AgentInfo,
    ) {
        let mut out = Vec::new();
        {
            let mut agents = self.agents.write().await;
            let entry = agents.entry(agent_id.to_owned()).or_insert_with(|| AgentEntry {
                agent_id: agent_id.to_owned(),
                connection_id: None,
                status: AgentStatus::Offline,
                info: AgentInfo::default(),
                last_ping_ms: 0,
                queue: CommandQueue::new(self.config.max_queue_size),
                dispatched: None,
                executing: None,
                grace_epoch: 0,
                exec_epoch: 0,
            });

            entry.connection_id = Some(connection_id.to_owned());
            entry.grace_epoch += 1;
            entry.dispatched = None;
            entry.last_ping_ms = epoch_ms();

            let maintenance = info
                .metadata
                .as_ref()
                .and_then(|m| m.get("maintenance"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            entry.info = info;
            entry.status = if maintenance { AgentStatus::Maintenance } else { AgentStatus::Online };

            // A command was in flight when the agent dropped. Ask the agent
            // whether it can resume; an unanswered query fails the command
            // with reason "agent disconnect" once the window closes.
            if let Some(exec) = entry.executing.as_mut() {
                exec.awaiting_resume = true;
                let command_id = exec.command.id.clone();
                let epoch = exec.epoch;
                entry.status = AgentStatus::Executing;
                out.push(Outgoing::ToConnection {
                    connection_id: connection_id.to_owned(),
                    frame: protocol::encode(&Payload::CommandQuery(CommandQuery {
                        command_id: command_id.clone(),
                    })),
                });

                let dispatcher = Arc::clone(self);
                let agent = agent_id.to_owned();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(RESUME_WINDOW) => {
                            dispatcher.resume_timeout(&agent, &command_id, epoch).await;
                        }
                    }
                });
            }

            self.forward_head(entry, &mut out);
            push_status_update(entry, &mut out);
        }

        self.audit.append(AuditKind::AgentConnected, None, Some(agent_id), None, serde_json::json!({}));
        self.flush(out).await;
        tracing::info!(agent_id, connection_id, "agent connected");
    }

    /// The agent's socket closed. Its queue survives for the grace window.
    ///
    /// `connection_id` is the socket that actually closed; a stale close
    /// event racing a fresh reconnect (duplicate agent eviction) is ignored.
    pub async fn agent_disconnected(self: &Arc<Self>, agent_id: &str, connection_id: &str) {
        let mut out = Vec::new();
        let epoch = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else { return };
            if entry.connection_id.as_deref() != Some(connection_id) {
                return;
            }
            entry.connection_id = None;
            entry.status = AgentStatus::Offline;
            entry.grace_epoch += 1;
            // A forwarded-but-unacked command falls back to plain queued.
            entry.dispatched = None;
            push_status_update(entry, &mut out);
            entry.grace_epoch
        };

        self.audit.append(AuditKind::AgentDisconnected, None, Some(agent_id), None, serde_json::json!({}));
        self.flush(out).await;
        tracing::info!(agent_id, "agent disconnected, grace window started");
        self.spawn_grace_timer(agent_id, epoch);
    }

    fn spawn_grace_timer(self: &Arc<Self>, agent_id: &str, epoch: u64) {
        let dispatcher = Arc::clone(self);
        let agent_id = agent_id.to_owned();
        let grace = self.config.grace_window();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    dispatcher.grace_expired(&agent_id, epoch).await;
                }
            }
        });
    }

    /// Grace window elapsed without a reconnect: fail everything held for
    /// this agent. The epoch check serializes against reconnects.
    async fn grace_expired(self: &Arc<Self>, agent_id: &str, epoch: u64) {
        let mut out = Vec::new();
        let mut failed = 0usize;
        {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else { return };
            if entry.grace_epoch != epoch || entry.connection_id.is_some() {
                return;
            }

            if let Some(exec) = entry.executing.take() {
                failed += 1;
                self.finish_command(entry, exec, CommandStatus::Failed, "agent unavailable", &mut out);
            }
            entry.dispatched = None;
            for command in entry.queue.drain() {
                failed += 1;
                push_command_status(&command, CommandStatus::Failed, Some("agent unavailable"), &mut out);
                self.audit.append(
                    AuditKind::CommandFailed,
                    Some(&command.user_id),
                    Some(agent_id),
                    Some(&command.id),
                    serde_json::json!({"reason": "agent unavailable"}),
                );
            }
            push_status_update(entry, &mut out);
        }

        if failed > 0 {
            tracing::warn!(agent_id, failed, "grace window expired, commands failed");
        }
        self.flush(out).await;
    }

    /// The resume window closed without the agent picking the command back
    /// up: the spec's reconnect check resolves it as failed.
    async fn resume_timeout(self: &Arc<Self>, agent_id: &str, command_id: &str, epoch: u64) {
        let mut out = Vec::new();
        {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else { return };
            let unanswered = entry.executing.as_ref().is_some_and(|x| {
                x.command.id == command_id && x.epoch == epoch && x.awaiting_resume
            });
            if !unanswered {
                return;
            }
            let Some(exec) = entry.executing.take() else { return };
            self.finish_command(entry, exec, CommandStatus::Failed, "agent disconnect", &mut out);
            self.forward_head(entry, &mut out);
            push_status_update(entry, &mut out);
        }
        tracing::warn!(agent_id, command_id, "agent could not resume command after reconnect");
        self.flush(out).await;
    }

    /// A fatal agent error: mark the agent errored and apply the grace
    /// policy so its work is failed unless it recovers in time.
    pub async fn agent_fatal_error(self: &Arc<Self>, agent_id: &str, code: &str, message: &str) {
        let mut out = Vec::new();
        let epoch = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else { return };
            entry.status = AgentStatus::Error;
            entry.grace_epoch += 1;
            entry.dispatched = None;
            push_status_update(entry, &mut out);
            entry.grace_epoch
        };

        self.audit.append(
            AuditKind::SecurityAlert,
            None,
            Some(agent_id),
            None,
            serde_json::json!({"code": code, "message": message, "fatal": true}),
        );
        self.flush(out).await;
        tracing::warn!(agent_id, code, "fatal agent error, grace window started");
        self.spawn_grace_timer(agent_id, epoch);
    }

    /// Heartbeat payload from an agent.
    pub async fn agent_heartbeat(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.last_ping_ms = epoch_ms();
        }
    }

    /// The connection became unhealthy: executing work on it is failed as an
    /// agent timeout.
    pub async fn connection_unhealthy(self: &Arc<Self>, connection_id: &str) {
        let mut out = Vec::new();
        {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents
                .values_mut()
                .find(|e| e.connection_id.as_deref() == Some(connection_id))
            else {
                return;
            };
            if let Some(exec) = entry.executing.take() {
                self.finish_command(entry, exec, CommandStatus::Failed, "agent timeout", &mut out);
                push_status_update(entry, &mut out);
            }
        }
        self.flush(out).await;
    }

    // -- Submission & cancellation ---------------------------------------------

    /// Accept a dashboard command submission. The command is queued and, if
    /// the agent is idle, forwarded at once.
    pub async fn submit(
        self: &Arc<Self>,
        user_id: &str,
        submitter_connection_id: &str,
        request: &CommandRequest,
    ) -> Result<SubmitAck, DispatchError> {
        let Some(agent_id) = request.agent_id.as_deref() else {
            return Err(DispatchError::new(ErrorCode::ValidationFailed, "agentId is required"));
        };
        if request.content.is_empty() {
            return Err(DispatchError::new(ErrorCode::ValidationFailed, "content is empty"));
        }

        let command = Command {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            submitter_connection_id: submitter_connection_id.to_owned(),
            agent_id: agent_id.to_owned(),
            content: request.content.clone(),
            priority: request.priority,
            time_limit: request
                .execution_constraints
                .as_ref()
                .and_then(|c| c.time_limit_ms)
                .map(Duration::from_millis),
            created_at_ms: epoch_ms(),
        };

        let mut out = Vec::new();
        let ack = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id).filter(|e| e.accepts_work()) else {
                return Err(DispatchError::new(
                    ErrorCode::AgentOffline,
                    format!("agent not connected: {agent_id}"),
                ));
            };

            let command_id = command.id.clone();
            let position = match entry.queue.enqueue(command.clone()) {
                Ok(position) => position,
                Err(full) => {
                    return Err(DispatchError {
                        code: ErrorCode::QueueFull,
                        message: format!("queue full for agent {agent_id}"),
                        details: Some(serde_json::json!({"maxQueueSize": full.max})),
                    });
                }
            };
            push_command_status(&command, CommandStatus::Queued, None, &mut out);
            self.forward_head(entry, &mut out);
            push_status_update(entry, &mut out);

            SubmitAck {
                command_id,
                queue_position: position,
                estimated_start_time: estimated_start_ms(
                    position,
                    Duration::from_secs(self.config.queue_step_secs),
                ),
            }
        };

        self.flush(out).await;
        Ok(ack)
    }

    /// Cancel a command wherever it is.
    pub async fn cancel(
        self: &Arc<Self>,
        actor_user_id: &str,
        command_id: &str,
        reason: &str,
    ) -> Result<CommandStatus, DispatchError> {
        let mut out = Vec::new();
        let outcome = {
            let mut agents = self.agents.write().await;

            let Some(entry) = agents.values_mut().find(|e| {
                e.queue.get(command_id).is_some()
                    || e.executing.as_ref().is_some_and(|x| x.command.id == command_id)
            }) else {
                return Err(DispatchError::new(
                    ErrorCode::CommandNotFound,
                    format!("command not found: {command_id}"),
                ));
            };

            if let Some(command) = entry.queue.remove(command_id) {
                // If this was the forwarded head, tell the agent to drop it.
                let was_dispatched =
                    entry.dispatched.as_ref().is_some_and(|d| d.command_id == command_id);
                if was_dispatched {
                    entry.dispatched = None;
                    if let Some(ref conn) = entry.connection_id {
                        out.push(cancel_frame(conn, command_id, reason));
                    }
                }
                push_command_status(&command, CommandStatus::Cancelled, Some(reason), &mut out);
                push_queue_positions(entry, &mut out);
                self.audit.append(
                    AuditKind::CommandCancelled,
                    Some(actor_user_id),
                    Some(&entry.agent_id),
                    Some(command_id),
                    serde_json::json!({"reason": reason, "state": "queued"}),
                );
                self.forward_head(entry, &mut out);
                push_status_update(entry, &mut out);
                CommandStatus::Cancelled
            } else {
                // Executing: ask the agent, fall back to a force kill.
                let Some(exec) = entry.executing.as_mut() else {
                    return Err(DispatchError::new(
                        ErrorCode::CommandNotFound,
                        format!("command not found: {command_id}"),
                    ));
                };
                exec.cancel_requested = true;
                let epoch = exec.epoch;
                if let Some(ref conn) = entry.connection_id {
                    out.push(cancel_frame(conn, command_id, reason));
                }
                self.audit.append(
                    AuditKind::CommandCancelled,
                    Some(actor_user_id),
                    Some(&entry.agent_id),
                    Some(command_id),
                    serde_json::json!({"reason": reason, "state": "executing"}),
                );

                let dispatcher = Arc::clone(self);
                let agent = entry.agent_id.clone();
                let cmd = command_id.to_owned();
                let kill_after = self.config.cancel_kill_timeout();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(kill_after) => {
                            dispatcher.force_cancel(&agent, &cmd, epoch).await;
                        }
                    }
                });
                CommandStatus::Executing
            }
        };

        self.flush(out).await;
        Ok(outcome)
    }

    /// The agent never acknowledged a cancel; terminate the command
    /// server-side.
    async fn force_cancel(self: &Arc<Self>, agent_id: &str, command_id: &str, epoch: u64) {
        let mut out = Vec::new();
        {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else { return };
            let still_executing = entry
                .executing
                .as_ref()
                .is_some_and(|x| x.command.id == command_id && x.epoch == epoch && x.cancel_requested);
            if !still_executing {
                return;
            }
            let Some(exec) = entry.executing.take() else { return };
            self.finish_command(entry, exec, CommandStatus::Cancelled, "cancel timeout", &mut out);
            self.forward_head(entry, &mut out);
            push_status_update(entry, &mut out);
        }
        tracing::warn!(agent_id, command_id, "cancel unacknowledged, force-killed");
        self.flush(out).await;
    }

    /// Cancel every executing and queued command on every agent. Returns the
    /// counts the emergency-stop audit event reports.
    pub async fn cancel_all(self: &Arc<Self>, reason: &str) -> StopCounts {
        let mut out = Vec::new();
        let mut counts = StopCounts::default();
        {
            let mut agents = self.agents.write().await;
            for entry in agents.values_mut() {
                let mut touched = false;

                if let Some(exec) = entry.executing.take() {
                    if let Some(ref conn) = entry.connection_id {
                        out.push(cancel_frame(conn, &exec.command.id, reason));
                    }
                    self.finish_command(entry, exec, CommandStatus::Cancelled, reason, &mut out);
                    counts.commands_cancelled += 1;
                    touched = true;
                }

                // The forwarded head is cancelled on the agent side too.
                if let Some(dispatched) = entry.dispatched.take() {
                    if let Some(ref conn) = entry.connection_id {
                        out.push(cancel_frame(conn, &dispatched.command_id, reason));
                    }
                }

                for command in entry.queue.drain() {
                    push_command_status(&command, CommandStatus::Cancelled, Some(reason), &mut out);
                    self.audit.append(
                        AuditKind::CommandCancelled,
                        Some(&command.user_id),
                        Some(&entry.agent_id),
                        Some(&command.id),
                        serde_json::json!({"reason": reason}),
                    );
                    counts.commands_cancelled += 1;
                    touched = true;
                }

                if entry.connection_id.is_some() {
                    counts.agents_stopped += 1;
                    if entry.status == AgentStatus::Executing {
                        entry.status = AgentStatus::Online;
                    }
                }
                if touched {
                    push_status_update(entry, &mut out);
                }
            }
        }
        self.flush(out).await;
        counts
    }

    // -- Agent-originated command traffic --------------------------------------

    /// Agent acknowledged a forwarded command: it leaves the queue and
    /// occupies the executing slot.
    pub async fn agent_ack(self: &Arc<Self>, agent_id: &str, ack: &CommandAck) {
        let mut out = Vec::new();
        {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else { return };

            let is_dispatched =
                entry.dispatched.as_ref().is_some_and(|d| d.command_id == ack.command_id);
            if is_dispatched {
                let Some(dispatched) = entry.dispatched.take() else { return };
                let Some(command) = entry.queue.remove(&ack.command_id) else { return };

                out.push(Outgoing::ToConnection {
                    connection_id: command.submitter_connection_id.clone(),
                    frame: protocol::encode(&Payload::CommandAck(ack.clone())),
                });
                push_command_status(&command, CommandStatus::Executing, None, &mut out);
                self.audit.append(
                    AuditKind::CommandExecuted,
                    Some(&command.user_id),
                    Some(agent_id),
                    Some(&command.id),
                    serde_json::json!({"priority": command.priority}),
                );

                entry.status = AgentStatus::Executing;
                entry.executing = Some(Executing {
                    command,
                    started_at_ms: epoch_ms(),
                    seq: 1,
                    cancel_requested: false,
                    awaiting_resume: false,
                    epoch: dispatched.epoch,
                });
                push_queue_positions(entry, &mut out);
                push_status_update(entry, &mut out);
            } else if entry
                .executing
                .as_ref()
                .is_some_and(|x| x.command.id == ack.command_id)
            {
                // Progress ack for the running command. It also answers a
                // pending resume query after a reconnect.
                let submitter = match entry.executing.as_mut() {
                    Some(exec) => {
                        exec.awaiting_resume = false;
                        exec.command.submitter_connection_id.clone()
                    }
                    None => return,
                };
                out.push(Outgoing::ToConnection {
                    connection_id: submitter,
                    frame: protocol::encode(&Payload::CommandAck(ack.clone())),
                });
            }
        }
        self.flush(out).await;
    }

    /// Agent reported a command result.
    pub async fn command_complete(self: &Arc<Self>, agent_id: &str, payload: &CommandComplete) {
        let mut out = Vec::new();
        {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else { return };
            let matches = entry
                .executing
                .as_ref()
                .is_some_and(|x| x.command.id == payload.command_id);
            if !matches {
                tracing::debug!(agent_id, command_id = %payload.command_id, "stale command result ignored");
                return;
            }
            let Some(exec) = entry.executing.take() else { return };

            let status = terminal_status(&payload.status, exec.cancel_requested);
            // Relay the completion frame itself, then the status transition.
            let frame = protocol::encode(&Payload::CommandComplete(payload.clone()));
            out.push(Outgoing::ToConnection {
                connection_id: exec.command.submitter_connection_id.clone(),
                frame: frame.clone(),
            });
            out.push(Outgoing::ToSubscribers {
                agent_id: agent_id.to_owned(),
                class: EventClass::Command,
                frame,
                exclude: Some(exec.command.submitter_connection_id.clone()),
            });
            self.finish_command(entry, exec, status, &payload.status, &mut out);
            self.forward_head(entry, &mut out);
            push_status_update(entry, &mut out);
        }
        self.flush(out).await;
    }

    /// Terminal output from the executing command. The dispatcher re-tags
    /// the frame with its own per-command sequence so every subscriber sees
    /// a gap-free, strictly increasing series.
    pub async fn terminal_output(&self, agent_id: &str, mut payload: TerminalOutput) {
        let frame = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else { return };
            let Some(exec) = entry.executing.as_mut() else { return };
            if exec.command.id != payload.command_id {
                return;
            }
            payload.sequence = exec.seq;
            exec.seq += 1;
            protocol::encode(&Payload::TerminalOutput(payload))
        };
        self.fanout.publish(agent_id, EventClass::Terminal, &frame).await;
    }

    /// Trace event from the executing command, forwarded with a rewritten
    /// envelope.
    pub async fn trace_event(&self, agent_id: &str, payload: TraceEvent) {
        let frame = protocol::encode(&Payload::TraceEvent(payload));
        self.fanout.publish(agent_id, EventClass::Trace, &frame).await;
    }

    // -- Read models -----------------------------------------------------------

    pub async fn agent_view(&self, agent_id: &str) -> Option<AgentView> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(view_of)
    }

    pub async fn agents_snapshot(&self) -> Vec<AgentView> {
        let agents = self.agents.read().await;
        let mut views: Vec<AgentView> = agents.values().map(view_of).collect();
        views.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        views
    }

    /// Queue positions for one agent: (command id, position).
    pub async fn queue_snapshot(&self, agent_id: &str) -> Vec<(String, usize)> {
        let agents = self.agents.read().await;
        agents
            .get(agent_id)
            .map(|e| e.queue.positions().into_iter().map(|(c, p)| (c.id.clone(), p)).collect())
            .unwrap_or_default()
    }

    pub async fn connected_agent_count(&self) -> usize {
        let agents = self.agents.read().await;
        agents.values().filter(|e| e.connection_id.is_some()).count()
    }

    // -- Internals -------------------------------------------------------------

    /// Forward the queue head to an idle agent. The command keeps its queue
    /// position until the agent acknowledges. Caller holds the lock.
    fn forward_head(self: &Arc<Self>, entry: &mut AgentEntry, out: &mut Vec<Outgoing>) {
        if !entry.idle_and_connected() {
            return;
        }
        let Some(head) = entry.queue.head() else {
            if entry.status == AgentStatus::Executing {
                entry.status = AgentStatus::Online;
            }
            return;
        };
        let command_id = head.id.clone();
        let content = head.content.clone();
        let priority = head.priority;
        let time_limit = head.time_limit;

        entry.exec_epoch += 1;
        let epoch = entry.exec_epoch;
        entry.dispatched = Some(Dispatched { command_id: command_id.clone(), epoch });

        let Some(ref conn) = entry.connection_id else { return };
        out.push(Outgoing::ToConnection {
            connection_id: conn.clone(),
            frame: protocol::encode(&Payload::CommandRequest(CommandRequest {
                command_id: Some(command_id.clone()),
                agent_id: Some(entry.agent_id.clone()),
                content,
                priority,
                execution_constraints: time_limit.map(|t| protocol::ExecutionConstraints {
                    time_limit_ms: Some(t.as_millis() as u64),
                }),
            })),
        });

        // The watchdog starts at forward time and covers both the unacked
        // and the executing phases.
        let timeout = time_limit.unwrap_or_else(|| self.config.command_timeout());
        let dispatcher = Arc::clone(self);
        let agent = entry.agent_id.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    dispatcher.execution_timeout(&agent, &command_id, epoch).await;
                }
            }
        });
    }

    /// Record a terminal transition and tell everyone. Caller holds the
    /// lock and has already removed the command from the executing slot.
    fn finish_command(
        &self,
        entry: &mut AgentEntry,
        exec: Executing,
        status: CommandStatus,
        reason: &str,
        out: &mut Vec<Outgoing>,
    ) {
        debug_assert!(status.is_terminal());
        let duration = epoch_ms().saturating_sub(exec.started_at_ms);
        push_command_status(&exec.command, status, Some(reason), out);
        if entry.status == AgentStatus::Executing {
            entry.status = AgentStatus::Online;
        }

        let kind = match status {
            CommandStatus::Completed => AuditKind::CommandCompleted,
            CommandStatus::Cancelled => AuditKind::CommandCancelled,
            _ => AuditKind::CommandFailed,
        };
        self.audit.append(
            kind,
            Some(&exec.command.user_id),
            Some(&entry.agent_id),
            Some(&exec.command.id),
            serde_json::json!({"reason": reason, "durationMs": duration}),
        );
    }

    /// Execution watchdog fired: the command never finished in time,
    /// whether it is still awaiting an ack or running.
    async fn execution_timeout(self: &Arc<Self>, agent_id: &str, command_id: &str, epoch: u64) {
        let mut out = Vec::new();
        let mut fired = false;
        {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(agent_id) else { return };

            let running = entry
                .executing
                .as_ref()
                .is_some_and(|x| x.command.id == command_id && x.epoch == epoch);
            let awaiting_ack = entry
                .dispatched
                .as_ref()
                .is_some_and(|d| d.command_id == command_id && d.epoch == epoch);

            if running {
                let Some(exec) = entry.executing.take() else { return };
                if let Some(ref conn) = entry.connection_id {
                    out.push(cancel_frame(conn, command_id, "command timeout"));
                }
                self.finish_command(entry, exec, CommandStatus::Failed, "command timeout", &mut out);
                fired = true;
            } else if awaiting_ack {
                entry.dispatched = None;
                if let Some(command) = entry.queue.remove(command_id) {
                    if let Some(ref conn) = entry.connection_id {
                        out.push(cancel_frame(conn, command_id, "command timeout"));
                    }
                    push_command_status(&command, CommandStatus::Failed, Some("command timeout"), &mut out);
                    self.audit.append(
                        AuditKind::CommandFailed,
                        Some(&command.user_id),
                        Some(agent_id),
                        Some(&command.id),
                        serde_json::json!({"reason": "command timeout"}),
                    );
                    push_queue_positions(entry, &mut out);
                    fired = true;
                }
            }

            if fired {
                self.forward_head(entry, &mut out);
                push_status_update(entry, &mut out);
            }
        }
        if fired {
            tracing::warn!(agent_id, command_id, "command execution timed out");
            self.flush(out).await;
        }
    }

    async fn flush(&self, out: Vec<Outgoing>) {
        for item in out {
            match item {
                Outgoing::ToConnection { connection_id, frame } => {
                    self.pool.send_to(&connection_id, frame).await;
                }
                Outgoing::ToSubscribers { agent_id, class, frame, exclude } => {
                    self.fanout.publish_except(&agent_id, class, &frame, exclude.as_deref()).await;
                }
            }
        }
    }
}

fn view_of(entry: &AgentEntry) -> AgentView {
    AgentView {
        agent_id: entry.agent_id.clone(),
        status: entry.status.as_str().to_owned(),
        version: entry.info.version.clone(),
        capabilities: entry.info.capabilities.clone(),
        queued_commands: entry.queue.len(),
        executing_command_id: entry.executing.as_ref().map(|x| x.command.id.clone()),
        last_ping_ms: entry.last_ping_ms,
    }
}

fn cancel_frame(connection_id: &str, command_id: &str, reason: &str) -> Outgoing {
    Outgoing::ToConnection {
        connection_id: connection_id.to_owned(),
        frame: protocol::encode(&Payload::CommandCancel(CommandCancel {
            command_id: command_id.to_owned(),
            reason: reason.to_owned(),
        })),
    }
}

/// Map an agent-reported completion status onto the state machine.
fn terminal_status(wire_status: &str, cancel_requested: bool) -> CommandStatus {
    let lowered = wire_status.to_ascii_lowercase();
    if lowered.contains("cancel") || cancel_requested {
        CommandStatus::Cancelled
    } else if lowered.contains("fail") || lowered.contains("error") {
        CommandStatus::Failed
    } else {
        CommandStatus::Completed
    }
}

/// Queue a `COMMAND_STATUS_UPDATE` to the submitter and command subscribers.
fn push_command_status(
    command: &Command,
    status: CommandStatus,
    reason: Option<&str>,
    out: &mut Vec<Outgoing>,
) {
    let frame = protocol::encode(&Payload::CommandStatusUpdate(CommandStatusUpdate {
        command_id: command.id.clone(),
        agent_id: command.agent_id.clone(),
        status: status.as_str().to_owned(),
        reason: reason.map(str::to_owned),
    }));
    out.push(Outgoing::ToConnection {
        connection_id: command.submitter_connection_id.clone(),
        frame: frame.clone(),
    });
    out.push(Outgoing::ToSubscribers {
        agent_id: command.agent_id.clone(),
        class: EventClass::Command,
        frame,
        exclude: Some(command.submitter_connection_id.clone()),
    });
}

/// Queue `QUEUE_POSITION_UPDATE` frames for everything still queued, to each
/// submitter and to queue subscribers.
fn push_queue_positions(entry: &AgentEntry, out: &mut Vec<Outgoing>) {
    for (command, position) in entry.queue.positions() {
        let frame = protocol::encode(&Payload::QueuePositionUpdate(QueuePositionUpdate {
            command_id: command.id.clone(),
            queue_position: position,
        }));
        out.push(Outgoing::ToConnection {
            connection_id: command.submitter_connection_id.clone(),
            frame: frame.clone(),
        });
        out.push(Outgoing::ToSubscribers {
            agent_id: entry.agent_id.clone(),
            class: EventClass::Queue,
            frame,
            exclude: Some(command.submitter_connection_id.clone()),
        });
    }
}

/// Queue an `AGENT_STATUS_UPDATE` to status subscribers.
fn push_status_update(entry: &AgentEntry, out: &mut Vec<Outgoing>) {
    let frame = protocol::encode(&Payload::AgentStatusUpdate(AgentStatusUpdate {
        agent_id: entry.agent_id.clone(),
        status: entry.status.as_str().to_owned(),
        queued_commands: entry.queue.len(),
        executing_command_id: entry.executing.as_ref().map(|x| x.command.id.clone()),
    }));
    out.push(Outgoing::ToSubscribers {
        agent_id: entry.agent_id.clone(),
        class: EventClass::Status,
        frame,
        exclude: None,
    });
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
