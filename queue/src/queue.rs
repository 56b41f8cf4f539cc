//! Task queue facade
//!
//! Public entry point for every task mutation: enqueue, the long-poll
//! rendezvous, acknowledgement, responses, blocking/answering, retry and
//! cancellation, plus the maintenance sweeps driven by the scheduler.
//!
//! A single queue mutex guards the waiting registry, the pending-ACK map,
//! and every read that participates in a match decision, so "find a
//! matching task, reserve the agent, publish the delivery" is atomic with
//! respect to concurrent enqueues. Reads of terminal/historical rows go
//! straight to the store.

use crate::bus::{EventBus, QueueEvent};
use crate::matching;
use crate::registry::{Delivery, WaitingAgent, WaitingRegistry};
use chrono::{DateTime, Utc};
use dispatch_core::{
    error::{DispatchError, Result},
    models::{
        Agent, AgentActivity, AgentSummary, ControlSignal, EvictionAction, HistoryFilter,
        MessageRole, NewTask, OriginKind, Task, TaskMessage, TaskStatus, MSG_TYPE_ANSWER,
        MSG_TYPE_BLOCK_EVENT, MSG_TYPE_PROGRESS, MSG_TYPE_STATUS_CHANGE,
    },
    protocol::BlockReason,
    repository::{QueueStats, Store},
    validation::DispatchValidator,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Tunable thresholds and timeouts. All injectable; defaults match the
/// documented constants.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Long-poll duration when the caller passes none
    pub default_poll_timeout: Duration,
    /// PENDING_ACK reclaim threshold
    pub pending_ack_timeout: Duration,
    /// No-progress threshold for ASSIGNED/IN_PROGRESS reclaim
    pub stale_task_threshold: Duration,
    /// Agent-unseen threshold for orphaned-assignment reclaim
    pub orphan_agent_threshold: Duration,
    /// Event bus buffer depth per subscriber
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_poll_timeout: dispatch_core::validation::DEFAULT_POLL_TIMEOUT,
            pending_ack_timeout: Duration::from_secs(60),
            stale_task_threshold: Duration::from_secs(30 * 60),
            orphan_agent_threshold: Duration::from_secs(5 * 60),
            event_capacity: crate::bus::DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Bookkeeping record for a delivered-but-unconfirmed task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAck {
    pub task_id: String,
    pub agent_id: String,
    pub sent_at: DateTime<Utc>,
}

/// Terminal payload attached by `send_response`.
#[derive(Debug, Clone, Default)]
pub struct ResponsePayload {
    pub message: String,
    pub artifacts: Vec<String>,
    pub diff: Option<String>,
    pub blocked_reason: Option<String>,
}

struct QueueState {
    waiting: WaitingRegistry,
    pending_acks: HashMap<String, PendingAck>,
    /// System prompts stored for agents that were not parked at broadcast time
    pending_prompts: HashMap<String, String>,
}

/// The task queue. Cheap to clone via `Arc` by callers; internally all
/// transient state sits behind one mutex.
pub struct TaskQueue<S> {
    store: Arc<S>,
    bus: EventBus,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

fn exceeds(now: DateTime<Utc>, since: DateTime<Utc>, threshold: Duration) -> bool {
    match (now - since).to_std() {
        Ok(elapsed) => elapsed > threshold,
        Err(_) => false, // `since` lies in the future
    }
}

impl<S: Store> TaskQueue<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        let bus = EventBus::new(config.event_capacity);
        Self {
            store,
            bus,
            config,
            state: Mutex::new(QueueState {
                waiting: WaitingRegistry::new(),
                pending_acks: HashMap::new(),
                pending_prompts: HashMap::new(),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // ---- producer surface ------------------------------------------------

    /// Persist a task, publish `task:created`, and try an immediate match
    /// against the waiting registry. Tasks with unsatisfied dependencies
    /// park as BLOCKED instead.
    pub async fn enqueue(&self, new: NewTask) -> Result<Task> {
        DispatchValidator::validate_new_task(&new)?;
        if let Some(target) = &new.to.agent_id {
            if self.store.get(target).await?.is_none() {
                return Err(DispatchError::validation_reason(
                    "unknown_agent",
                    format!("target agent '{target}' is not registered"),
                ));
            }
        }

        let task = Task::from_new(new);
        self.store.insert(&task).await?;
        self.record_creation(&task.id).await?;
        // The row is visible to readers before anyone hears about it
        self.bus.publish(QueueEvent::TaskCreated { task: task.clone() });
        if matches!(task.from.kind, OriginKind::Agent) {
            self.bus.publish(QueueEvent::Delegation {
                task_id: task.id.clone(),
                source_agent_id: task.from.id.clone(),
                target_agent_id: task.to.agent_id.clone(),
            });
        }

        let mut state = self.state.lock().await;
        if !task.dependencies.is_empty() && !self.deps_satisfied(&task).await? {
            return self
                .apply_status(&task.id, task.status, TaskStatus::Blocked)
                .await;
        }
        state.waiting.sweep_closed();
        if let Some(agent_id) = state.waiting.select_for_task(&task) {
            return self.deliver_locked(&mut state, task, &agent_id).await;
        }
        Ok(task)
    }

    // ---- agent surface ---------------------------------------------------

    /// Long-poll for work on behalf of an agent.
    ///
    /// Serves, in order: an eligible queued task, a pending control signal,
    /// or parks the agent until delivery or timeout. `None` means timeout.
    /// A caller that aborts mid-wait leaves a closed channel behind; the
    /// next registry sweep removes it, and any task already marked
    /// PENDING_ACK is reclaimed by the scheduler.
    pub async fn wait_for_task(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>> {
        let agent = self
            .store
            .get(agent_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_agent(agent_id))?;
        self.store.heartbeat(agent_id).await?;
        self.bus.publish(QueueEvent::AgentHeartbeat {
            agent_id: agent_id.to_string(),
        });

        let mut rx = {
            let mut state = self.state.lock().await;
            state.waiting.sweep_closed();

            if let Some(task) = self.find_eligible_queued(&agent).await? {
                let mut updated = self
                    .apply_status(&task.id, task.status, TaskStatus::PendingAck)
                    .await?;
                state.pending_acks.insert(
                    updated.id.clone(),
                    PendingAck {
                        task_id: updated.id.clone(),
                        agent_id: agent_id.to_string(),
                        sent_at: Utc::now(),
                    },
                );
                self.inject_dependency_outputs(&mut updated).await?;
                return Ok(Some(Delivery::Task(updated)));
            }

            if let Some(request) = self.store.check_eviction(agent_id).await? {
                return Ok(Some(Delivery::Control(ControlSignal::Evict {
                    reason: request.reason,
                    action: request.action,
                })));
            }

            if let Some(prompt) = state.pending_prompts.remove(agent_id) {
                return Ok(Some(Delivery::Control(ControlSignal::SystemPrompt {
                    prompt,
                })));
            }

            state
                .waiting
                .insert(agent_id, agent.capabilities.clone(), agent.workspace.clone())
        };

        tokio::select! {
            delivered = &mut rx => match delivered {
                Ok(delivery) => {
                    let _ = self.store.heartbeat(agent_id).await;
                    Ok(Some(delivery))
                }
                // Sender dropped without delivering (superseded wait)
                Err(_) => Ok(None),
            },
            _ = tokio::time::sleep(timeout) => {
                let mut state = self.state.lock().await;
                state.waiting.remove(agent_id);
                drop(state);
                // A delivery may have raced the timeout; prefer it
                match rx.try_recv() {
                    Ok(delivery) => {
                        let _ = self.store.heartbeat(agent_id).await;
                        Ok(Some(delivery))
                    }
                    Err(_) => Ok(None),
                }
            }
        }
    }

    /// Confirm receipt of a delivered task. The acknowledging agent must be
    /// the one the task was delivered to.
    pub async fn ack_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let mut state = self.state.lock().await;
        match state.pending_acks.get(task_id) {
            None => {
                let reason = if self.store.get_by_id(task_id).await?.is_some() {
                    "not_pending"
                } else {
                    "not_found"
                };
                return Err(DispatchError::validation_reason(
                    reason,
                    format!("task '{task_id}' has no pending delivery"),
                ));
            }
            Some(entry) if entry.agent_id != agent_id => {
                return Err(DispatchError::validation_reason(
                    "wrong_agent",
                    format!("task '{task_id}' was delivered to '{}'", entry.agent_id),
                ));
            }
            Some(_) => {}
        }
        state.pending_acks.remove(task_id);

        let mut task = self
            .store
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(task_id))?;
        task.assigned_to = Some(agent_id.to_string());
        self.store.update(&task).await?;
        let updated = self
            .apply_status(task_id, TaskStatus::PendingAck, TaskStatus::Assigned)
            .await?;
        drop(state);

        self.store.heartbeat(agent_id).await?;
        Ok(updated)
    }

    /// Record a progress observation and move ASSIGNED work to IN_PROGRESS.
    pub async fn update_progress(
        &self,
        task_id: &str,
        agent_id: &str,
        message: &str,
        percentage: Option<f64>,
        phase: Option<String>,
    ) -> Result<Task> {
        self.store.heartbeat(agent_id).await?;
        self.bus.publish(QueueEvent::AgentHeartbeat {
            agent_id: agent_id.to_string(),
        });

        let _state = self.state.lock().await;
        let task = self
            .store
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(task_id))?;
        if task.assigned_to.as_deref() != Some(agent_id) {
            return Err(DispatchError::validation_reason(
                "wrong_agent",
                format!("task '{task_id}' is not assigned to '{agent_id}'"),
            ));
        }

        let updated = match task.status {
            TaskStatus::Assigned => {
                self.apply_status(task_id, TaskStatus::Assigned, TaskStatus::InProgress)
                    .await?
            }
            TaskStatus::InProgress => task,
            other => {
                return Err(DispatchError::invalid_transition(
                    other,
                    TaskStatus::InProgress,
                ))
            }
        };

        let mut metadata = serde_json::Map::new();
        if let Some(percentage) = percentage {
            metadata.insert("percentage".to_string(), json!(percentage));
        }
        if let Some(phase) = phase {
            metadata.insert("phase".to_string(), json!(phase));
        }
        self.store
            .add_message(
                task_id,
                MessageRole::Agent,
                message,
                Value::Object(metadata),
                MSG_TYPE_PROGRESS,
                None,
                true,
            )
            .await?;

        Ok(updated)
    }

    /// Apply an agent-reported transition with its result payload.
    pub async fn send_response(
        &self,
        task_id: &str,
        status: TaskStatus,
        payload: ResponsePayload,
    ) -> Result<Task> {
        const REPORTABLE: [TaskStatus; 6] = [
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Approved,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Blocked,
        ];
        if !REPORTABLE.contains(&status) {
            return Err(DispatchError::Validation(format!(
                "'{status}' is not a reportable status"
            )));
        }

        let _state = self.state.lock().await;
        let mut task = self
            .store
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(task_id))?;
        if !task.can_transition_to(status) {
            return Err(DispatchError::invalid_transition(task.status, status));
        }

        if status == TaskStatus::Blocked {
            let reason = payload
                .blocked_reason
                .as_deref()
                .filter(|r| !r.trim().is_empty())
                .ok_or_else(|| {
                    DispatchError::Validation(
                        "blockedReason is required when reporting BLOCKED".to_string(),
                    )
                })?;
            self.store
                .add_message(
                    task_id,
                    MessageRole::Agent,
                    reason,
                    json!({"type": MSG_TYPE_BLOCK_EVENT, "reason": reason}),
                    MSG_TYPE_BLOCK_EVENT,
                    None,
                    true,
                )
                .await?;
        }

        task.response = Some(dispatch_core::models::TaskResponse {
            message: payload.message,
            artifacts: payload.artifacts,
            diff: payload.diff,
        });
        self.store.update(&task).await?;

        self.apply_status(task_id, task.status, status).await
    }

    /// Park a task as BLOCKED with a structured block event.
    pub async fn block_task(
        &self,
        task_id: &str,
        reason: BlockReason,
        question: &str,
        summary: &str,
        notes: Option<String>,
        files: Vec<String>,
    ) -> Result<Task> {
        let _state = self.state.lock().await;
        let task = self
            .store
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(task_id))?;
        if !task.can_transition_to(TaskStatus::Blocked) {
            return Err(DispatchError::invalid_transition(
                task.status,
                TaskStatus::Blocked,
            ));
        }

        self.store
            .add_message(
                task_id,
                MessageRole::Agent,
                question,
                json!({
                    "type": MSG_TYPE_BLOCK_EVENT,
                    "reason": reason,
                    "question": question,
                    "summary": summary,
                    "notes": notes,
                    "files": files,
                }),
                MSG_TYPE_BLOCK_EVENT,
                None,
                false,
            )
            .await?;

        self.apply_status(task_id, task.status, TaskStatus::Blocked)
            .await
    }

    /// Answer a blocked task and return it to the queue; an eligible parked
    /// agent receives it immediately.
    pub async fn answer_task(&self, task_id: &str, answer: &str) -> Result<Task> {
        if answer.trim().is_empty() {
            return Err(DispatchError::empty_field("answer"));
        }

        let mut state = self.state.lock().await;
        let task = self
            .store
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(task_id))?;
        if task.status != TaskStatus::Blocked {
            return Err(DispatchError::validation_reason(
                "not_blocked",
                format!("task '{task_id}' is {}", task.status),
            ));
        }

        self.store
            .add_message(
                task_id,
                MessageRole::User,
                answer,
                json!({}),
                MSG_TYPE_ANSWER,
                None,
                true,
            )
            .await?;
        let updated = self
            .apply_status(task_id, TaskStatus::Blocked, TaskStatus::Queued)
            .await?;

        if updated.dependencies.is_empty() || self.deps_satisfied(&updated).await? {
            state.waiting.sweep_closed();
            if let Some(agent_id) = state.waiting.select_for_task(&updated) {
                return self.deliver_locked(&mut state, updated, &agent_id).await;
            }
        }
        Ok(updated)
    }

    /// Apply a review verdict: approval moves IN_REVIEW work forward,
    /// rejection sends the assignee back to address the comments.
    pub async fn apply_review(&self, task_id: &str, approved: bool) -> Result<Task> {
        let _state = self.state.lock().await;
        let task = self
            .store
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(task_id))?;
        if task.status != TaskStatus::InReview {
            return Err(DispatchError::validation_reason(
                "not_in_review",
                format!("task '{task_id}' is {}", task.status),
            ));
        }
        let to = if approved {
            TaskStatus::Approved
        } else {
            TaskStatus::InProgress
        };
        self.apply_status(task_id, TaskStatus::InReview, to).await
    }

    /// Forcibly return a task to QUEUED from any non-COMPLETED state,
    /// clearing assignment and any pending delivery.
    pub async fn force_retry(&self, task_id: &str) -> Result<Task> {
        let mut state = self.state.lock().await;
        self.force_retry_locked(&mut state, task_id).await
    }

    /// Cancel a non-terminal task. Cancelling a cancelled task is a no-op.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task> {
        let mut state = self.state.lock().await;
        let task = self
            .store
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(task_id))?;
        if task.status == TaskStatus::Cancelled {
            return Ok(task);
        }
        if task.status.is_terminal() {
            return Err(DispatchError::invalid_transition(
                task.status,
                TaskStatus::Cancelled,
            ));
        }
        state.pending_acks.remove(task_id);
        self.apply_status(task_id, task.status, TaskStatus::Cancelled)
            .await
    }

    // ---- coordination ----------------------------------------------------

    /// Block until the task reaches a terminal state or the timeout expires.
    /// Returns the terminal task, or `None` on timeout.
    pub async fn wait_for_completion(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Option<Task>> {
        // Subscribe before the status check so a transition cannot slip
        // between the two.
        let mut rx = self.bus.subscribe();
        let task = self
            .store
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(task_id))?;
        if task.status.is_terminal() {
            return Ok(Some(task));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(QueueEvent::TaskUpdated { task_id: id, status }))
                    if id == task_id && status.is_terminal() =>
                {
                    return Ok(self.store.get_by_id(task_id).await?);
                }
                Ok(Ok(_)) => continue,
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {
                    // Missed events; fall back to polling the row
                    if let Some(task) = self.store.get_by_id(task_id).await? {
                        if task.status.is_terminal() {
                            return Ok(Some(task));
                        }
                    }
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }
    }

    // ---- control signals -------------------------------------------------

    /// Store an eviction signal; a parked agent receives it immediately.
    pub async fn evict_agent(
        &self,
        agent_id: &str,
        reason: &str,
        action: EvictionAction,
    ) -> Result<()> {
        self.store.request_eviction(agent_id, reason, action).await?;

        let mut state = self.state.lock().await;
        state.waiting.sweep_closed();
        if state.waiting.contains(agent_id) {
            if let Some(request) = self.store.check_eviction(agent_id).await? {
                state.waiting.deliver(
                    agent_id,
                    Delivery::Control(ControlSignal::Evict {
                        reason: request.reason,
                        action: request.action,
                    }),
                );
            }
        }
        Ok(())
    }

    /// Deliver a system prompt to every parked agent and store it for all
    /// other registered agents. Returns (delivered, stored).
    pub async fn broadcast_system_prompt(&self, prompt: &str) -> Result<(u32, u32)> {
        if prompt.trim().is_empty() {
            return Err(DispatchError::empty_field("prompt"));
        }
        let agents = self.store.list().await?;

        let mut state = self.state.lock().await;
        state.waiting.sweep_closed();
        let mut delivered = 0u32;
        let mut stored = 0u32;
        for agent in agents {
            let sent = state.waiting.contains(&agent.id)
                && state.waiting.deliver(
                    &agent.id,
                    Delivery::Control(ControlSignal::SystemPrompt {
                        prompt: prompt.to_string(),
                    }),
                );
            if sent {
                delivered += 1;
            } else {
                state
                    .pending_prompts
                    .insert(agent.id.clone(), prompt.to_string());
                stored += 1;
            }
        }
        Ok((delivered, stored))
    }

    // ---- introspection ---------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.store.get_by_id(task_id).await
    }

    pub async fn get_all(&self) -> Result<Vec<Task>> {
        self.store.get_by_statuses(&TaskStatus::ALL).await
    }

    pub async fn get_active(&self) -> Result<Vec<Task>> {
        self.store.get_active().await
    }

    pub async fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<Task>> {
        self.store.get_history(filter).await
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        self.store.get_stats().await
    }

    pub async fn get_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        self.store.get_messages(task_id).await
    }

    pub async fn waiting_agents(&self) -> HashMap<String, WaitingAgent> {
        let mut state = self.state.lock().await;
        state.waiting.sweep_closed();
        state.waiting.snapshot()
    }

    pub async fn is_agent_waiting(&self, agent_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state.waiting.sweep_closed();
        state.waiting.contains(agent_id)
    }

    pub async fn pending_acks(&self) -> HashMap<String, PendingAck> {
        self.state.lock().await.pending_acks.clone()
    }

    /// Tasks currently held by the agent (assigned and non-terminal).
    pub async fn assigned_tasks_for(&self, agent_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .store
            .get_by_assigned_to(agent_id)
            .await?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect())
    }

    /// The task's status trajectory, reconstructed from its message log.
    pub async fn status_history(&self, task_id: &str) -> Result<Vec<TaskStatus>> {
        let messages = self.store.get_messages(task_id).await?;
        let mut history = Vec::new();
        for message in messages {
            if message.message_type != MSG_TYPE_STATUS_CHANGE {
                continue;
            }
            if let Some(to) = message.metadata.get("to") {
                if let Ok(status) = serde_json::from_value::<TaskStatus>(to.clone()) {
                    history.push(status);
                }
            }
        }
        Ok(history)
    }

    /// Collected `response` payloads of the task's completed dependencies,
    /// keyed by dependency id.
    pub async fn dependency_outputs(&self, task: &Task) -> Result<Value> {
        let mut outputs = serde_json::Map::new();
        for dep_id in &task.dependencies {
            if let Some(dep) = self.store.get_by_id(dep_id).await? {
                if dep.status == TaskStatus::Completed {
                    if let Some(response) = dep.response {
                        outputs.insert(
                            dep_id.clone(),
                            json!({
                                "message": response.message,
                                "artifacts": response.artifacts,
                            }),
                        );
                    }
                }
            }
        }
        Ok(Value::Object(outputs))
    }

    /// Per-agent activity snapshot for `list_agents` and the periodic
    /// `agent:list` event.
    pub async fn agent_snapshot(&self) -> Result<Vec<AgentSummary>> {
        let agents = self.store.list().await?;
        let waiting_ids: Vec<String> = {
            let mut state = self.state.lock().await;
            state.waiting.sweep_closed();
            state.waiting.agent_ids()
        };

        let mut summaries = Vec::with_capacity(agents.len());
        for agent in agents {
            let held = self.assigned_tasks_for(&agent.id).await?;
            let status = if waiting_ids.contains(&agent.id) {
                AgentActivity::Waiting
            } else if !held.is_empty() {
                AgentActivity::Processing
            } else {
                AgentActivity::Offline
            };
            let current_task = held
                .iter()
                .max_by_key(|t| t.created_at)
                .map(|t| t.id.clone());
            summaries.push(AgentSummary {
                id: agent.id,
                display_name: agent.display_name,
                capabilities: agent.capabilities,
                last_seen: agent.last_seen,
                status,
                current_task,
            });
        }
        Ok(summaries)
    }

    // ---- maintenance sweeps (driven by the scheduler) ----------------------

    /// Step 1: requeue deliveries that were never acknowledged.
    pub async fn requeue_stuck_acks(&self, now: DateTime<Utc>) -> Result<u32> {
        let mut state = self.state.lock().await;
        let stuck: Vec<String> = state
            .pending_acks
            .values()
            .filter(|p| exceeds(now, p.sent_at, self.config.pending_ack_timeout))
            .map(|p| p.task_id.clone())
            .collect();

        let mut count = 0;
        for task_id in stuck {
            match self.force_retry_locked(&mut state, &task_id).await {
                Ok(_) => {
                    tracing::info!(task_id = %task_id, "requeued stuck PENDING_ACK task");
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to requeue stuck task");
                    // Drop the entry anyway so it cannot wedge the sweep
                    state.pending_acks.remove(&task_id);
                }
            }
        }
        Ok(count)
    }

    /// Step 2: return dependency-blocked tasks whose dependencies are all
    /// COMPLETED to the queue. Clarification blocks (no dependencies) only
    /// leave via `answer_task`.
    pub async fn unblock_ready(&self) -> Result<u32> {
        let blocked = self.store.get_by_status(TaskStatus::Blocked).await?;
        let mut count = 0;
        for task in blocked {
            if task.dependencies.is_empty() {
                continue;
            }
            if self.deps_satisfied(&task).await? {
                let _state = self.state.lock().await;
                // Re-check under the mutex; the task may have been cancelled
                // or answered since the scan.
                match self.store.get_by_id(&task.id).await? {
                    Some(current) if current.status == TaskStatus::Blocked => {
                        self.apply_status(&task.id, TaskStatus::Blocked, TaskStatus::Queued)
                            .await?;
                        count += 1;
                    }
                    _ => {}
                }
            }
        }
        Ok(count)
    }

    /// Step 3: greedily match queued tasks against parked agents, highest
    /// priority first. A reserved agent leaves the waiting set for the rest
    /// of the sweep.
    pub async fn assign_pending(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        state.waiting.sweep_closed();
        if state.waiting.is_empty() {
            return Ok(0);
        }

        let mut queued = self.store.get_by_status(TaskStatus::Queued).await?;
        matching::sort_for_dispatch(&mut queued);

        let mut count = 0;
        for task in queued {
            if state.waiting.is_empty() {
                break;
            }
            if !task.dependencies.is_empty() && !self.deps_satisfied(&task).await? {
                continue;
            }
            if let Some(agent_id) = state.waiting.select_for_task(&task) {
                self.deliver_locked(&mut state, task, &agent_id).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Step 4: requeue ASSIGNED/IN_PROGRESS tasks with no recent activity.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<u32> {
        let candidates = self
            .store
            .get_by_statuses(&[TaskStatus::Assigned, TaskStatus::InProgress])
            .await?;

        let mut count = 0;
        for task in candidates {
            let last_activity = match self.store.last_progress_at(&task.id).await? {
                Some(progress) => progress.max(task.created_at),
                None => task.created_at,
            };
            if exceeds(now, last_activity, self.config.stale_task_threshold) {
                let mut state = self.state.lock().await;
                match self.store.get_by_id(&task.id).await? {
                    Some(current) if current.status.is_active_assignment() => {
                        self.force_retry_locked(&mut state, &task.id).await?;
                        tracing::info!(task_id = %task.id, "reclaimed stale in-progress task");
                        count += 1;
                    }
                    _ => {}
                }
            }
        }
        Ok(count)
    }

    /// Step 5: requeue assignments held by agents that have gone dark.
    pub async fn reclaim_orphans(&self, now: DateTime<Utc>) -> Result<u32> {
        let candidates = self
            .store
            .get_by_statuses(&[TaskStatus::Assigned, TaskStatus::InProgress])
            .await?;

        let mut offline: HashMap<String, bool> = HashMap::new();
        let mut count = 0;
        for task in candidates {
            let Some(agent_id) = task.assigned_to.clone() else {
                continue;
            };
            let is_offline = match offline.get(&agent_id) {
                Some(v) => *v,
                None => {
                    let v = match self.store.get(&agent_id).await? {
                        Some(agent) => {
                            exceeds(now, agent.last_seen, self.config.orphan_agent_threshold)
                        }
                        None => true,
                    };
                    offline.insert(agent_id.clone(), v);
                    v
                }
            };
            if is_offline {
                let mut state = self.state.lock().await;
                match self.store.get_by_id(&task.id).await? {
                    Some(current) if current.status.is_active_assignment() => {
                        self.force_retry_locked(&mut state, &task.id).await?;
                        tracing::info!(task_id = %task.id, agent_id = %agent_id, "reclaimed orphaned assignment");
                        count += 1;
                    }
                    _ => {}
                }
            }
        }
        Ok(count)
    }

    /// Step 6: delete long-unseen agents that hold no work and are not
    /// parked.
    pub async fn cleanup_stale_agents(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<u64> {
        let mut keep: Vec<String> = {
            let mut state = self.state.lock().await;
            state.waiting.sweep_closed();
            state.waiting.agent_ids()
        };
        for task in self.store.get_active().await? {
            if let Some(agent_id) = task.assigned_to {
                if !keep.contains(&agent_id) {
                    keep.push(agent_id);
                }
            }
        }
        let stale_before = now
            - chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        self.store.cleanup_stale(stale_before, &keep).await
    }

    // ---- internals -------------------------------------------------------

    async fn record_creation(&self, task_id: &str) -> Result<()> {
        self.store
            .add_message(
                task_id,
                MessageRole::System,
                "task created",
                json!({"type": MSG_TYPE_STATUS_CHANGE, "to": TaskStatus::Queued}),
                MSG_TYPE_STATUS_CHANGE,
                None,
                true,
            )
            .await?;
        Ok(())
    }

    /// Write a status, record the transition in the message log, and
    /// publish the update (plus the completion redispatch when terminal).
    async fn apply_status(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<Task> {
        let updated = self.store.update_status(task_id, to).await?;
        self.store
            .add_message(
                task_id,
                MessageRole::System,
                &format!("status: {from} -> {to}"),
                json!({"type": MSG_TYPE_STATUS_CHANGE, "from": from, "to": to}),
                MSG_TYPE_STATUS_CHANGE,
                None,
                true,
            )
            .await?;
        self.bus.publish(QueueEvent::TaskUpdated {
            task_id: task_id.to_string(),
            status: to,
        });
        if to.is_terminal() {
            self.bus.publish(QueueEvent::TaskCompleted {
                task_id: task_id.to_string(),
                status: to,
            });
        }
        Ok(updated)
    }

    async fn deps_satisfied(&self, task: &Task) -> Result<bool> {
        for dep_id in &task.dependencies {
            // Unknown ids count as satisfied; phantom deps must not deadlock
            if let Some(dep) = self.store.get_by_id(dep_id).await? {
                if dep.status != TaskStatus::Completed {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn inject_dependency_outputs(&self, task: &mut Task) -> Result<()> {
        let outputs = self.dependency_outputs(task).await?;
        if let Value::Object(map) = &mut task.context {
            map.insert("dependencyOutputs".to_string(), outputs);
        }
        Ok(())
    }

    async fn find_eligible_queued(&self, agent: &Agent) -> Result<Option<Task>> {
        let queued = self.store.get_by_status(TaskStatus::Queued).await?;
        let mut eligible = Vec::new();
        for task in queued {
            if !matching::agent_matches_task(
                &task,
                &agent.id,
                &agent.capabilities,
                agent.workspace.as_ref(),
            ) {
                continue;
            }
            if !task.dependencies.is_empty() && !self.deps_satisfied(&task).await? {
                continue;
            }
            eligible.push(task);
        }
        matching::sort_for_dispatch(&mut eligible);
        Ok(eligible.into_iter().next())
    }

    /// Reserve `task` for `agent_id`: transition to PENDING_ACK, record the
    /// pending delivery, and push through the agent's channel. Must run
    /// under the queue mutex.
    async fn deliver_locked(
        &self,
        state: &mut QueueState,
        task: Task,
        agent_id: &str,
    ) -> Result<Task> {
        let mut updated = self
            .apply_status(&task.id, task.status, TaskStatus::PendingAck)
            .await?;
        state.pending_acks.insert(
            updated.id.clone(),
            PendingAck {
                task_id: updated.id.clone(),
                agent_id: agent_id.to_string(),
                sent_at: Utc::now(),
            },
        );
        self.inject_dependency_outputs(&mut updated).await?;
        if !state
            .waiting
            .deliver(agent_id, Delivery::Task(updated.clone()))
        {
            // The poll aborted after matching; the PENDING_ACK entry stands
            // and the scheduler reclaims it.
            tracing::warn!(task_id = %updated.id, agent_id, "delivery channel closed; task left PENDING_ACK");
        }
        Ok(updated)
    }

    async fn force_retry_locked(
        &self,
        state: &mut QueueState,
        task_id: &str,
    ) -> Result<Task> {
        let mut task = self
            .store
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(task_id))?;
        if task.status == TaskStatus::Completed {
            return Err(DispatchError::validation_reason(
                "completed",
                format!("task '{task_id}' is COMPLETED and cannot be retried"),
            ));
        }

        state.pending_acks.remove(task_id);
        let from = task.status;
        task.status = TaskStatus::Queued;
        task.assigned_to = None;
        task.completed_at = None;
        self.store.update(&task).await?;
        self.store
            .add_message(
                task_id,
                MessageRole::System,
                &format!("status: {from} -> {} (retry)", TaskStatus::Queued),
                json!({"type": MSG_TYPE_STATUS_CHANGE, "from": from, "to": TaskStatus::Queued, "retry": true}),
                MSG_TYPE_STATUS_CHANGE,
                None,
                true,
            )
            .await?;
        self.bus.publish(QueueEvent::TaskUpdated {
            task_id: task_id.to_string(),
            status: TaskStatus::Queued,
        });

        // Re-run the enqueue matching step
        if !task.dependencies.is_empty() && !self.deps_satisfied(&task).await? {
            return self
                .apply_status(task_id, TaskStatus::Queued, TaskStatus::Blocked)
                .await;
        }
        state.waiting.sweep_closed();
        if let Some(agent_id) = state.waiting.select_for_task(&task) {
            return self.deliver_locked(state, task, &agent_id).await;
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exceeds() {
        let now = Utc::now();
        let past = now - chrono::Duration::seconds(61);
        assert!(exceeds(now, past, Duration::from_secs(60)));
        assert!(!exceeds(now, past, Duration::from_secs(120)));
        // Future timestamps never exceed
        assert!(!exceeds(now, now + chrono::Duration::seconds(10), Duration::ZERO));
    }

    #[test]
    fn test_config_defaults_match_documented_constants() {
        let config = QueueConfig::default();
        assert_eq!(config.default_poll_timeout, Duration::from_secs(290));
        assert_eq!(config.pending_ack_timeout, Duration::from_secs(60));
        assert_eq!(config.stale_task_threshold, Duration::from_secs(1800));
        assert_eq!(config.orphan_agent_threshold, Duration::from_secs(300));
    }
}
