//! In-process event bus
//!
//! Single publish/subscribe point feeding the SSE/WebSocket fan-out.
//! Subscribers receive events in publish order; a slow subscriber lags and
//! drops the oldest events rather than ever blocking a publisher.

use dispatch_core::models::{AgentSummary, Task, TaskStatus};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default per-subscriber buffer depth.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Task and agent lifecycle events surfaced to external consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum QueueEvent {
    #[serde(rename = "task:created", rename_all = "camelCase")]
    TaskCreated { task: Task },

    #[serde(rename = "task:updated", rename_all = "camelCase")]
    TaskUpdated { task_id: String, status: TaskStatus },

    /// Convenience redispatch fired alongside `task:updated` on terminal
    /// transitions.
    #[serde(rename = "task:completed", rename_all = "camelCase")]
    TaskCompleted { task_id: String, status: TaskStatus },

    /// One agent enqueued work for another.
    #[serde(rename = "delegation", rename_all = "camelCase")]
    Delegation {
        task_id: String,
        source_agent_id: String,
        target_agent_id: Option<String>,
    },

    #[serde(rename = "agent:registered", rename_all = "camelCase")]
    AgentRegistered {
        agent_id: String,
        display_name: String,
    },

    #[serde(rename = "agent:heartbeat", rename_all = "camelCase")]
    AgentHeartbeat { agent_id: String },

    /// Periodic full snapshot published at the end of each scheduler tick.
    #[serde(rename = "agent:list", rename_all = "camelCase")]
    AgentList { agents: Vec<AgentSummary> },
}

/// Broadcast-backed bus. Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Never blocks; publishing with no
    /// subscribers is a no-op.
    pub fn publish(&self, event: QueueEvent) {
        tracing::trace!(?event, "publishing queue event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
