use crate::{
    error::Result,
    models::{
        Agent, EvictionAction, EvictionRequest, HistoryFilter, MessageRole, NewAgent,
        NewReviewComment, ReviewComment, Task, TaskMessage, TaskStatus,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Repository trait for task persistence.
///
/// Implementations must be thread-safe; all reads return deep copies that
/// callers may mutate freely.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Persist a fully-formed task row.
    async fn insert(&self, task: &Task) -> Result<()>;

    /// Atomic full-row write of an existing task.
    async fn update(&self, task: &Task) -> Result<()>;

    /// Atomic status write. Sets `completed_at = now` iff the new status is
    /// terminal and `completed_at` was null. Does NOT validate the state
    /// machine; callers do.
    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<Task>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Task>>;

    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    async fn get_by_statuses(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>>;

    async fn get_by_assigned_to(&self, agent_id: &str) -> Result<Vec<Task>>;

    /// All non-terminal tasks.
    async fn get_active(&self) -> Result<Vec<Task>>;

    /// Paginated listing, newest first.
    async fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<Task>>;

    async fn get_stats(&self) -> Result<QueueStats>;

    /// Admin wipe of tasks, their messages, and review comments.
    async fn clear_all(&self) -> Result<()>;

    /// Verify store connectivity.
    async fn health_check(&self) -> Result<()>;
}

/// Repository trait for the append-only per-task message log.
#[async_trait]
pub trait TaskMessageRepository: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn add_message(
        &self,
        task_id: &str,
        role: MessageRole,
        content: &str,
        metadata: Value,
        message_type: &str,
        reply_to: Option<i64>,
        is_read: bool,
    ) -> Result<TaskMessage>;

    /// Messages in insertion order.
    async fn get_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>>;

    /// Review-comment messages not yet read by the assignee.
    async fn get_unread_comments(&self, task_id: &str) -> Result<Vec<TaskMessage>>;

    async fn mark_comments_read(&self, task_id: &str) -> Result<()>;

    /// Timestamp of the newest message carrying `metadata.percentage`,
    /// i.e. the task's last progress observation.
    async fn last_progress_at(&self, task_id: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Repository trait for agent registration and liveness.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Upsert by id. Fails with `DuplicateDisplayName` when the display name
    /// is already held by a different agent id.
    async fn register(&self, agent: NewAgent) -> Result<Agent>;

    async fn get(&self, id: &str) -> Result<Option<Agent>>;

    /// Case-insensitive lookup; a leading `@` in the query is stripped.
    async fn get_by_display_name(&self, name: &str) -> Result<Option<Agent>>;

    async fn list(&self) -> Result<Vec<Agent>>;

    async fn by_capability(&self, capability: &str) -> Result<Vec<Agent>>;

    /// Set `last_seen = now`.
    async fn heartbeat(&self, id: &str) -> Result<()>;

    /// Full-row update (admin patches).
    async fn update_agent(&self, agent: &Agent) -> Result<()>;

    /// Store a pending control signal for the agent.
    async fn request_eviction(
        &self,
        id: &str,
        reason: &str,
        action: EvictionAction,
    ) -> Result<()>;

    /// Return and clear the pending control signal, if any.
    async fn check_eviction(&self, id: &str) -> Result<Option<EvictionRequest>>;

    /// Delete agents with `last_seen < stale_before` whose id is not in
    /// `keep`. Returns the number of deleted agents.
    async fn cleanup_stale(&self, stale_before: DateTime<Utc>, keep: &[String]) -> Result<u64>;
}

/// Repository trait for persisted review comments.
#[async_trait]
pub trait ReviewCommentRepository: Send + Sync {
    async fn add_comment(&self, comment: NewReviewComment) -> Result<ReviewComment>;

    async fn get_comments(&self, task_id: &str, unresolved_only: bool)
        -> Result<Vec<ReviewComment>>;

    async fn resolve_comment(&self, comment_id: i64) -> Result<()>;
}

/// The durable store behind the queue: one object implementing every
/// repository concern, the way a single SQLite database backs all tables.
pub trait Store:
    TaskRepository + TaskMessageRepository + AgentRepository + ReviewCommentRepository
{
}

impl<T> Store for T where
    T: TaskRepository + TaskMessageRepository + AgentRepository + ReviewCommentRepository
{
}

/// Aggregate task counts for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: u64,
    pub by_status: HashMap<TaskStatus, u64>,
    pub completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_stats_default() {
        let stats = QueueStats::default();
        assert_eq!(stats.total, 0);
        assert!(stats.by_status.is_empty());
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn test_queue_stats_serialization() {
        let mut stats = QueueStats::default();
        stats.total = 3;
        stats.by_status.insert(TaskStatus::Queued, 2);
        stats.by_status.insert(TaskStatus::Completed, 1);
        stats.completed = 1;

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total"], 3);
        assert_eq!(json["byStatus"]["QUEUED"], 2);
        assert_eq!(json["completed"], 1);
    }
}
