// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscription fan-out: routes agent-originated frames to the dashboards
//! that asked for them.
//!
//! Each dashboard gets one bounded delivery buffer with a drop-oldest rule;
//! a drain task feeds the connection's outbound queue. Frames for a single
//! command enter the buffer in dispatch order and leave it FIFO, so
//! per-command sequence order survives the hop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};

use crate::pool::ConnectionEntry;

/// Event classes a dashboard can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Agent status transitions.
    Status,
    /// Command lifecycle updates (ack, status, completion).
    Command,
    /// Terminal output chunks.
    Terminal,
    /// Trace events.
    Trace,
    /// Queue position updates.
    Queue,
}

impl EventClass {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "status" => Some(Self::Status),
            "command" => Some(Self::Command),
            "terminal" => Some(Self::Terminal),
            "trace" => Some(Self::Trace),
            "queue" => Some(Self::Queue),
            _ => None,
        }
    }
}

/// Which event classes one subscription wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassSet {
    pub status: bool,
    pub command: bool,
    pub terminal: bool,
    pub trace: bool,
    pub queue: bool,
}

impl ClassSet {
    pub fn all() -> Self {
        Self { status: true, command: true, terminal: true, trace: true, queue: true }
    }

    /// Build from event names, ignoring unknown ones. An empty list means
    /// everything.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut set = Self::default();
        let mut any = false;
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            any = true;
            match EventClass::parse(name) {
                Some(EventClass::Status) => set.status = true,
                Some(EventClass::Command) => set.command = true,
                Some(EventClass::Terminal) => set.terminal = true,
                Some(EventClass::Trace) => set.trace = true,
                Some(EventClass::Queue) => set.queue = true,
                None => {}
            }
        }
        if any { set } else { Self::all() }
    }

    pub fn contains(&self, class: EventClass) -> bool {
        match class {
            EventClass::Status => self.status,
            EventClass::Command => self.command,
            EventClass::Terminal => self.terminal,
            EventClass::Trace => self.trace,
            EventClass::Queue => self.queue,
        }
    }

    fn merge(&mut self, other: ClassSet) {
        self.status |= other.status;
        self.command |= other.command;
        self.terminal |= other.terminal;
        self.trace |= other.trace;
        self.queue |= other.queue;
    }
}

/// Bounded frame buffer with a drop-oldest overflow rule.
struct DeliveryBuffer {
    frames: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl DeliveryBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    async fn push(&self, frame: String) {
        let mut frames = self.frames.lock().await;
        if frames.len() >= self.capacity {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<String> {
        self.frames.lock().await.pop_front()
    }
}

struct DashboardSubs {
    /// Per-agent class sets; key `"*"` matches every agent.
    agents: HashMap<String, ClassSet>,
    buffer: Arc<DeliveryBuffer>,
}

/// The subscription registry.
pub struct Fanout {
    dashboards: RwLock<HashMap<String, DashboardSubs>>,
    buffer_capacity: usize,
}

impl Fanout {
    pub fn new(buffer_capacity: usize) -> Self {
        Self { dashboards: RwLock::new(HashMap::new()), buffer_capacity }
    }

    /// Register a dashboard connection and start its drain task. The task
    /// dies with the connection's cancellation token.
    pub async fn register(&self, entry: &Arc<ConnectionEntry>) {
        let buffer = Arc::new(DeliveryBuffer::new(self.buffer_capacity));
        let subs = DashboardSubs { agents: HashMap::new(), buffer: Arc::clone(&buffer) };
        self.dashboards.write().await.insert(entry.id.clone(), subs);

        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = entry.cancel.cancelled() => break,
                    _ = buffer.notify.notified() => {}
                }
                while let Some(frame) = buffer.pop().await {
                    if !entry.send(frame) && entry.cancel.is_cancelled() {
                        return;
                    }
                }
            }
        });
    }

    /// Merge a subscription for one agent (or `"*"`) into the dashboard's
    /// set. The dashboard must be registered.
    pub async fn subscribe(&self, dashboard_id: &str, agent_id: &str, classes: ClassSet) {
        let mut dashboards = self.dashboards.write().await;
        if let Some(subs) = dashboards.get_mut(dashboard_id) {
            subs.agents.entry(agent_id.to_owned()).or_default().merge(classes);
        }
    }

    /// Drop one agent's subscription.
    pub async fn unsubscribe(&self, dashboard_id: &str, agent_id: &str) {
        let mut dashboards = self.dashboards.write().await;
        if let Some(subs) = dashboards.get_mut(dashboard_id) {
            subs.agents.remove(agent_id);
        }
    }

    /// Remove a closed dashboard and all its subscriptions.
    pub async fn remove(&self, dashboard_id: &str) {
        self.dashboards.write().await.remove(dashboard_id);
    }

    pub async fn subscriber_count(&self, agent_id: &str, class: EventClass) -> usize {
        let dashboards = self.dashboards.read().await;
        dashboards.values().filter(|subs| wants(subs, agent_id, class)).count()
    }

    /// Total frames dropped to overflow across all dashboards.
    pub async fn dropped_frames(&self) -> u64 {
        let dashboards = self.dashboards.read().await;
        dashboards.values().map(|s| s.buffer.dropped.load(Ordering::Relaxed)).sum()
    }

    /// Deliver a frame about `agent_id` to every interested dashboard.
    pub async fn publish(&self, agent_id: &str, class: EventClass, frame: &str) {
        self.publish_except(agent_id, class, frame, None).await;
    }

    /// Like [`publish`](Self::publish), but skips one dashboard — used when
    /// the submitter already received a directed copy of the same frame.
    pub async fn publish_except(
        &self,
        agent_id: &str,
        class: EventClass,
        frame: &str,
        except: Option<&str>,
    ) {
        let buffers: Vec<Arc<DeliveryBuffer>> = {
            let dashboards = self.dashboards.read().await;
            dashboards
                .iter()
                .filter(|(id, _)| except != Some(id.as_str()))
                .filter(|(_, subs)| wants(subs, agent_id, class))
                .map(|(_, subs)| Arc::clone(&subs.buffer))
                .collect()
        };
        for buffer in buffers {
            buffer.push(frame.to_owned()).await;
        }
    }
}

fn wants(subs: &DashboardSubs, agent_id: &str, class: EventClass) -> bool {
    subs.agents.get(agent_id).is_some_and(|set| set.contains(class))
        || subs.agents.get("*").is_some_and(|set| set.contains(class))
}

#[cfg(test)]
#[path = "fanout_tests.rs"]
mod tests;
