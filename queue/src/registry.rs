//! Waiting-agent registry
//!
//! In-memory map of agents currently parked in a long-poll. Each entry owns
//! the sending half of a one-shot delivery channel; delivery consumes the
//! entry, so a task transition into PENDING_ACK hands the task to exactly
//! one agent. The registry itself is not synchronized; it lives inside the
//! queue mutex.

use crate::matching;
use chrono::{DateTime, Utc};
use dispatch_core::models::{ControlSignal, Task, WorkspaceContext};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Payload carried across a long-poll rendezvous.
#[derive(Debug)]
pub enum Delivery {
    Task(Task),
    Control(ControlSignal),
}

struct WaitingEntry {
    capabilities: Vec<String>,
    workspace: Option<WorkspaceContext>,
    enqueued_at: DateTime<Utc>,
    /// FIFO position; lower means waiting longer
    seq: u64,
    tx: oneshot::Sender<Delivery>,
}

/// Copied, channel-free view of a waiting entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingAgent {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub workspace: Option<WorkspaceContext>,
    pub enqueued_at: DateTime<Utc>,
}

/// Map of parked agents. An agent appears at most once; re-parking an agent
/// supersedes (and closes) its previous channel.
#[derive(Default)]
pub struct WaitingRegistry {
    entries: HashMap<String, WaitingEntry>,
    next_seq: u64,
}

impl WaitingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an agent, returning the receiving half of its delivery channel.
    pub fn insert(
        &mut self,
        agent_id: &str,
        capabilities: Vec<String>,
        workspace: Option<WorkspaceContext>,
    ) -> oneshot::Receiver<Delivery> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            agent_id.to_string(),
            WaitingEntry {
                capabilities,
                workspace,
                enqueued_at: Utc::now(),
                seq,
                tx,
            },
        );
        rx
    }

    pub fn remove(&mut self, agent_id: &str) -> bool {
        self.entries.remove(agent_id).is_some()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.entries.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose receiver hung up (aborted long-polls). Returns the
    /// number of swept entries.
    pub fn sweep_closed(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.tx.is_closed());
        before - self.entries.len()
    }

    /// The eligible agent that has been waiting the longest, if any.
    pub fn select_for_task(&self, task: &Task) -> Option<String> {
        self.entries
            .iter()
            .filter(|(agent_id, entry)| {
                !entry.tx.is_closed()
                    && matching::agent_matches_task(
                        task,
                        agent_id,
                        &entry.capabilities,
                        entry.workspace.as_ref(),
                    )
            })
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(agent_id, _)| agent_id.clone())
    }

    /// Remove the agent's entry and push the payload through its channel.
    /// Returns false if the agent was not parked or its receiver hung up.
    pub fn deliver(&mut self, agent_id: &str, delivery: Delivery) -> bool {
        match self.entries.remove(agent_id) {
            Some(entry) => entry.tx.send(delivery).is_ok(),
            None => false,
        }
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> HashMap<String, WaitingAgent> {
        self.entries
            .iter()
            .map(|(agent_id, entry)| {
                (
                    agent_id.clone(),
                    WaitingAgent {
                        agent_id: agent_id.clone(),
                        capabilities: entry.capabilities.clone(),
                        workspace: entry.workspace.clone(),
                        enqueued_at: entry.enqueued_at,
                    },
                )
            })
            .collect()
    }
}
