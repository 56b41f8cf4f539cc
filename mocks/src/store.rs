//! Mock implementation of the dispatch store
//!
//! Thread-safe in-memory store with:
//! - Error injection capabilities
//! - Call tracking for verification
//! - Direct-mutation helpers for deterministic time-based tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::{
    error::{DispatchError, Result},
    models::{
        Agent, EvictionAction, EvictionRequest, HistoryFilter, MessageRole, NewAgent,
        NewReviewComment, ReviewComment, Task, TaskMessage, TaskStatus,
    },
    repository::{
        AgentRepository, QueueStats, ReviewCommentRepository, TaskMessageRepository,
        TaskRepository,
    },
    validation::normalize_alias,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// In-memory implementation of every dispatch repository trait.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tasks: Mutex<HashMap<String, Task>>,
    messages: Mutex<Vec<TaskMessage>>,
    agents: Mutex<HashMap<String, Agent>>,
    evictions: Mutex<HashMap<String, EvictionRequest>>,
    comments: Mutex<Vec<ReviewComment>>,
    next_message_id: AtomicI64,
    next_comment_id: AtomicI64,
    error_injection: Mutex<Option<DispatchError>>,
    call_history: Mutex<Vec<String>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an error returned by the next repository operation.
    pub fn inject_error(&self, error: DispatchError) {
        *self.inner.error_injection.lock() = Some(error);
    }

    /// History of called repository methods.
    pub fn call_history(&self) -> Vec<String> {
        self.inner.call_history.lock().clone()
    }

    /// Assert a repository method was called at least once.
    pub fn assert_called(&self, method: &str) {
        let history = self.inner.call_history.lock();
        assert!(
            history.iter().any(|call| call == method),
            "Method '{method}' was not called. Call history: {:?}",
            *history
        );
    }

    /// Backdate a task's creation timestamp (for stale-task tests).
    pub fn set_created_at(&self, task_id: &str, at: DateTime<Utc>) {
        if let Some(task) = self.inner.tasks.lock().get_mut(task_id) {
            task.created_at = at;
        }
    }

    /// Backdate an agent's last_seen (for orphan/offline tests).
    pub fn set_last_seen(&self, agent_id: &str, at: DateTime<Utc>) {
        if let Some(agent) = self.inner.agents.lock().get_mut(agent_id) {
            agent.last_seen = at;
        }
    }

    /// Backdate a message timestamp by id (for stale-progress tests).
    pub fn set_message_timestamp(&self, message_id: i64, at: DateTime<Utc>) {
        if let Some(msg) = self
            .inner
            .messages
            .lock()
            .iter_mut()
            .find(|m| m.id == message_id)
        {
            msg.timestamp = at;
        }
    }

    fn check_error_injection(&self) -> Result<()> {
        if let Some(error) = self.inner.error_injection.lock().take() {
            return Err(error);
        }
        Ok(())
    }

    fn record_call(&self, method: &str) {
        self.inner.call_history.lock().push(method.to_string());
    }
}

#[async_trait]
impl TaskRepository for MockStore {
    async fn insert(&self, task: &Task) -> Result<()> {
        self.record_call("insert");
        self.check_error_injection()?;
        let mut tasks = self.inner.tasks.lock();
        if tasks.contains_key(&task.id) {
            return Err(DispatchError::Validation(format!(
                "Task '{}' already exists",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update(&self, task: &Task) -> Result<()> {
        self.record_call("update");
        self.check_error_injection()?;
        let mut tasks = self.inner.tasks.lock();
        if !tasks.contains_key(&task.id) {
            return Err(DispatchError::not_found_task(&task.id));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        self.record_call("update_status");
        self.check_error_injection()?;
        let mut tasks = self.inner.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| DispatchError::not_found_task(id))?;
        task.status = status;
        if status.is_terminal() && task.completed_at.is_none() {
            task.completed_at = Some(Utc::now());
        }
        Ok(task.clone())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Task>> {
        self.record_call("get_by_id");
        self.check_error_injection()?;
        Ok(self.inner.tasks.lock().get(id).cloned())
    }

    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.record_call("get_by_status");
        self.check_error_injection()?;
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn get_by_statuses(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        self.record_call("get_by_statuses");
        self.check_error_injection()?;
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn get_by_assigned_to(&self, agent_id: &str) -> Result<Vec<Task>> {
        self.record_call("get_by_assigned_to");
        self.check_error_injection()?;
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|t| t.assigned_to.as_deref() == Some(agent_id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn get_active(&self) -> Result<Vec<Task>> {
        self.record_call("get_active");
        self.check_error_injection()?;
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<Task>> {
        self.record_call("get_history");
        self.check_error_injection()?;
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|t| filter.status.map(|s| t.status == s).unwrap_or(true))
            .filter(|t| {
                filter
                    .agent_id
                    .as_ref()
                    .map(|a| t.assigned_to.as_ref() == Some(a))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.unwrap_or(50) as usize;
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        self.record_call("get_stats");
        self.check_error_injection()?;
        let tasks = self.inner.tasks.lock();
        let mut by_status: HashMap<TaskStatus, u64> = HashMap::new();
        for task in tasks.values() {
            *by_status.entry(task.status).or_insert(0) += 1;
        }
        let completed = by_status.get(&TaskStatus::Completed).copied().unwrap_or(0);
        Ok(QueueStats {
            total: tasks.len() as u64,
            by_status,
            completed,
        })
    }

    async fn clear_all(&self) -> Result<()> {
        self.record_call("clear_all");
        self.check_error_injection()?;
        self.inner.tasks.lock().clear();
        self.inner.messages.lock().clear();
        self.inner.comments.lock().clear();
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.record_call("health_check");
        self.check_error_injection()
    }
}

#[async_trait]
impl TaskMessageRepository for MockStore {
    async fn add_message(
        &self,
        task_id: &str,
        role: MessageRole,
        content: &str,
        metadata: Value,
        message_type: &str,
        reply_to: Option<i64>,
        is_read: bool,
    ) -> Result<TaskMessage> {
        self.record_call("add_message");
        self.check_error_injection()?;
        if !self.inner.tasks.lock().contains_key(task_id) {
            return Err(DispatchError::not_found_task(task_id));
        }
        let message = TaskMessage {
            id: self.inner.next_message_id.fetch_add(1, Ordering::SeqCst) + 1,
            task_id: task_id.to_string(),
            role,
            content: content.to_string(),
            metadata,
            message_type: message_type.to_string(),
            reply_to,
            is_read,
            timestamp: Utc::now(),
        };
        self.inner.messages.lock().push(message.clone());
        Ok(message)
    }

    async fn get_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        self.record_call("get_messages");
        self.check_error_injection()?;
        Ok(self
            .inner
            .messages
            .lock()
            .iter()
            .filter(|m| m.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_unread_comments(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        self.record_call("get_unread_comments");
        self.check_error_injection()?;
        Ok(self
            .inner
            .messages
            .lock()
            .iter()
            .filter(|m| m.task_id == task_id && m.message_type == "review_comment" && !m.is_read)
            .cloned()
            .collect())
    }

    async fn mark_comments_read(&self, task_id: &str) -> Result<()> {
        self.record_call("mark_comments_read");
        self.check_error_injection()?;
        for message in self.inner.messages.lock().iter_mut() {
            if message.task_id == task_id && message.message_type == "review_comment" {
                message.is_read = true;
            }
        }
        Ok(())
    }

    async fn last_progress_at(&self, task_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.record_call("last_progress_at");
        self.check_error_injection()?;
        Ok(self
            .inner
            .messages
            .lock()
            .iter()
            .filter(|m| m.task_id == task_id && m.metadata.get("percentage").is_some())
            .map(|m| m.timestamp)
            .max())
    }
}

#[async_trait]
impl AgentRepository for MockStore {
    async fn register(&self, new: NewAgent) -> Result<Agent> {
        self.record_call("register");
        self.check_error_injection()?;
        let id = new
            .id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("agent-{}", Utc::now().timestamp_millis()));
        let display_name = new
            .display_name
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| id.clone());

        let mut agents = self.inner.agents.lock();
        let normalized = normalize_alias(&display_name);
        if let Some(holder) = agents
            .values()
            .find(|a| normalize_alias(&a.display_name) == normalized)
        {
            if holder.id != id {
                return Err(DispatchError::DuplicateDisplayName(display_name));
            }
        }

        let now = Utc::now();
        let agent = match agents.get(&id) {
            Some(existing) => Agent {
                display_name,
                capabilities: new.capabilities,
                color: new.color,
                workspace: new.workspace,
                source: new.source,
                last_seen: now,
                ..existing.clone()
            },
            None => Agent {
                id: id.clone(),
                display_name,
                capabilities: new.capabilities,
                color: new.color,
                workspace: new.workspace,
                source: new.source,
                created_at: now,
                last_seen: now,
            },
        };
        agents.insert(id, agent.clone());
        Ok(agent)
    }

    async fn get(&self, id: &str) -> Result<Option<Agent>> {
        self.record_call("get");
        self.check_error_injection()?;
        Ok(self.inner.agents.lock().get(id).cloned())
    }

    async fn get_by_display_name(&self, name: &str) -> Result<Option<Agent>> {
        self.record_call("get_by_display_name");
        self.check_error_injection()?;
        let normalized = normalize_alias(name);
        Ok(self
            .inner
            .agents
            .lock()
            .values()
            .find(|a| normalize_alias(&a.display_name) == normalized)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        self.record_call("list");
        self.check_error_injection()?;
        let mut agents: Vec<Agent> = self.inner.agents.lock().values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }

    async fn by_capability(&self, capability: &str) -> Result<Vec<Agent>> {
        self.record_call("by_capability");
        self.check_error_injection()?;
        Ok(self
            .inner
            .agents
            .lock()
            .values()
            .filter(|a| a.capabilities.iter().any(|c| c == capability))
            .cloned()
            .collect())
    }

    async fn heartbeat(&self, id: &str) -> Result<()> {
        self.record_call("heartbeat");
        self.check_error_injection()?;
        let mut agents = self.inner.agents.lock();
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| DispatchError::not_found_agent(id))?;
        agent.last_seen = Utc::now();
        Ok(())
    }

    async fn update_agent(&self, updated: &Agent) -> Result<()> {
        self.record_call("update_agent");
        self.check_error_injection()?;
        let mut agents = self.inner.agents.lock();
        let normalized = normalize_alias(&updated.display_name);
        if let Some(holder) = agents
            .values()
            .find(|a| normalize_alias(&a.display_name) == normalized)
        {
            if holder.id != updated.id {
                return Err(DispatchError::DuplicateDisplayName(
                    updated.display_name.clone(),
                ));
            }
        }
        if !agents.contains_key(&updated.id) {
            return Err(DispatchError::not_found_agent(&updated.id));
        }
        agents.insert(updated.id.clone(), updated.clone());
        Ok(())
    }

    async fn request_eviction(
        &self,
        id: &str,
        reason: &str,
        action: EvictionAction,
    ) -> Result<()> {
        self.record_call("request_eviction");
        self.check_error_injection()?;
        if !self.inner.agents.lock().contains_key(id) {
            return Err(DispatchError::not_found_agent(id));
        }
        self.inner.evictions.lock().insert(
            id.to_string(),
            EvictionRequest {
                agent_id: id.to_string(),
                reason: reason.to_string(),
                action,
                requested_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn check_eviction(&self, id: &str) -> Result<Option<EvictionRequest>> {
        self.record_call("check_eviction");
        self.check_error_injection()?;
        Ok(self.inner.evictions.lock().remove(id))
    }

    async fn cleanup_stale(&self, stale_before: DateTime<Utc>, keep: &[String]) -> Result<u64> {
        self.record_call("cleanup_stale");
        self.check_error_injection()?;
        let mut agents = self.inner.agents.lock();
        let before = agents.len();
        agents.retain(|id, agent| agent.last_seen >= stale_before || keep.contains(id));
        Ok((before - agents.len()) as u64)
    }
}

#[async_trait]
impl ReviewCommentRepository for MockStore {
    async fn add_comment(&self, comment: NewReviewComment) -> Result<ReviewComment> {
        self.record_call("add_comment");
        self.check_error_injection()?;
        if !self.inner.tasks.lock().contains_key(&comment.task_id) {
            return Err(DispatchError::not_found_task(&comment.task_id));
        }
        let stored = ReviewComment {
            id: self.inner.next_comment_id.fetch_add(1, Ordering::SeqCst) + 1,
            task_id: comment.task_id,
            file_path: comment.file_path,
            line_number: comment.line_number,
            content: comment.content,
            author: comment.author,
            thread_id: comment.thread_id,
            resolved: false,
            created_at: Utc::now(),
        };
        self.inner.comments.lock().push(stored.clone());
        Ok(stored)
    }

    async fn get_comments(
        &self,
        task_id: &str,
        unresolved_only: bool,
    ) -> Result<Vec<ReviewComment>> {
        self.record_call("get_comments");
        self.check_error_injection()?;
        Ok(self
            .inner
            .comments
            .lock()
            .iter()
            .filter(|c| c.task_id == task_id && (!unresolved_only || !c.resolved))
            .cloned()
            .collect())
    }

    async fn resolve_comment(&self, comment_id: i64) -> Result<()> {
        self.record_call("resolve_comment");
        self.check_error_injection()?;
        let mut comments = self.inner.comments.lock();
        match comments.iter_mut().find(|c| c.id == comment_id) {
            Some(comment) => {
                comment.resolved = true;
                Ok(())
            }
            None => Err(DispatchError::NotFound(format!(
                "Review comment {comment_id} not found"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::models::NewTask;

    #[tokio::test]
    async fn test_error_injection_fires_once() {
        let store = MockStore::new();
        store.inject_error(DispatchError::Database("boom".to_string()));

        assert!(store.health_check().await.is_err());
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_call_history_tracking() {
        let store = MockStore::new();
        let task = Task::from_new(NewTask::from_user("u", "p"));
        store.insert(&task).await.unwrap();
        store.get_by_id(&task.id).await.unwrap();

        store.assert_called("insert");
        store.assert_called("get_by_id");
    }

    #[tokio::test]
    async fn test_terminal_status_stamps_completed_at() {
        let store = MockStore::new();
        let task = Task::from_new(NewTask::from_user("u", "p"));
        store.insert(&task).await.unwrap();

        let done = store
            .update_status(&task.id, TaskStatus::Failed)
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_backdate_helpers() {
        let store = MockStore::new();
        let task = Task::from_new(NewTask::from_user("u", "p"));
        store.insert(&task).await.unwrap();

        let past = Utc::now() - chrono::Duration::minutes(45);
        store.set_created_at(&task.id, past);
        let loaded = store.get_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.created_at, past);
    }
}
