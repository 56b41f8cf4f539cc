//! RPC handler
//!
//! Implements [`ProtocolHandler`] over the task queue. Request-level
//! validation (aliases, timeouts, admin gating) lives here; queue semantics
//! stay in `dispatch-queue`.

use crate::auth::AdminGate;
use async_trait::async_trait;
use dispatch_core::{
    error::{DispatchError, Result},
    models::{
        Agent, AgentSource, AgentSummary, MessageRole, NewAgent, NewReviewComment, NewTask,
        ReviewComment, TaskOrigin, TaskStatus, MSG_TYPE_REVIEW_COMMENT,
    },
    protocol::*,
    repository::{QueueStats, Store},
    validation::{clamp_poll_timeout, DispatchValidator},
};
use dispatch_queue::{Delivery, QueueEvent, ResponsePayload, TaskQueue};
use serde_json::json;
use std::sync::Arc;

/// The dispatch RPC handler, generic over the backing store.
pub struct DispatchHandler<S> {
    queue: Arc<TaskQueue<S>>,
    gate: AdminGate,
}

impl<S: Store> DispatchHandler<S> {
    pub fn new(queue: Arc<TaskQueue<S>>, gate: AdminGate) -> Self {
        Self { queue, gate }
    }

    pub fn queue(&self) -> &Arc<TaskQueue<S>> {
        &self.queue
    }

    /// Resolve an agent id or `@display-name` alias to the agent record.
    async fn resolve_agent(&self, id_or_alias: &str) -> Result<Agent> {
        if let Some(agent) = self.queue.store().get(id_or_alias).await? {
            return Ok(agent);
        }
        self.queue
            .store()
            .get_by_display_name(id_or_alias)
            .await?
            .ok_or_else(|| DispatchError::not_found_agent(id_or_alias))
    }
}

#[async_trait]
impl<S: Store> ProtocolHandler for DispatchHandler<S> {
    async fn register_agent(&self, params: RegisterAgentParams) -> Result<RegisterAgentResult> {
        if let Some(name) = &params.display_name {
            DispatchValidator::validate_display_name(name)?;
        }
        if let Some(id) = &params.id {
            DispatchValidator::validate_agent_id(id)?;
        }
        for capability in &params.capabilities {
            DispatchValidator::validate_capability(capability)?;
        }
        let source = match params.source.as_deref() {
            None | Some("CLI") => AgentSource::Cli,
            Some("IDE") => AgentSource::Ide,
            Some(other) => {
                return Err(DispatchError::Validation(format!(
                    "unknown agent source '{other}'"
                )))
            }
        };

        let agent = self
            .queue
            .store()
            .register(NewAgent {
                id: params.id,
                display_name: params.display_name,
                capabilities: params.capabilities,
                color: None,
                workspace: params.workspace_context,
                source,
            })
            .await?;

        self.queue.bus().publish(QueueEvent::AgentRegistered {
            agent_id: agent.id.clone(),
            display_name: agent.display_name.clone(),
        });

        Ok(RegisterAgentResult {
            id: agent.id,
            display_name: agent.display_name,
            capabilities: agent.capabilities,
        })
    }

    async fn wait_for_prompt(&self, params: WaitForPromptParams) -> Result<WaitForPromptResult> {
        let agent = self.resolve_agent(&params.agent_id).await?;
        let timeout =
            clamp_poll_timeout(params.timeout, self.queue.config().default_poll_timeout);

        match self.queue.wait_for_task(&agent.id, timeout).await? {
            Some(Delivery::Task(task)) => Ok(WaitForPromptResult::Task {
                task_id: task.id,
                prompt: task.prompt,
                from: task.from,
                priority: task.priority,
                context: task.context,
            }),
            Some(Delivery::Control(signal)) => Ok(WaitForPromptResult::Control(signal)),
            None => Ok(WaitForPromptResult::timeout()),
        }
    }

    async fn ack_task(&self, params: AckTaskParams) -> Result<()> {
        self.queue
            .ack_task(&params.task_id, &params.agent_id)
            .await?;
        Ok(())
    }

    async fn send_response(&self, params: SendResponseParams) -> Result<()> {
        self.queue
            .send_response(
                &params.task_id,
                params.status,
                ResponsePayload {
                    message: params.message,
                    artifacts: params.artifacts,
                    diff: params.diff,
                    blocked_reason: params.blocked_reason,
                },
            )
            .await?;
        Ok(())
    }

    async fn update_progress(&self, params: UpdateProgressParams) -> Result<()> {
        self.queue
            .update_progress(
                &params.task_id,
                &params.agent_id,
                &params.message,
                params.percentage,
                params.phase,
            )
            .await?;
        Ok(())
    }

    async fn assign_task(&self, params: AssignTaskParams) -> Result<AssignTaskResult> {
        if params.workspace_id.trim().is_empty() {
            return Err(DispatchError::validation_reason(
                "workspace_required",
                "assign_task requires a workspaceId",
            ));
        }

        let mut to = params.routing_hints();
        // Producers may target by alias; the queue wants the id
        if let Some(target) = &to.agent_id {
            to.agent_id = Some(self.resolve_agent(target).await?.id);
        }

        let from = match &params.source_agent_id {
            Some(agent_id) => TaskOrigin::agent(self.resolve_agent(agent_id).await?.id),
            None => TaskOrigin::user("operator"),
        };

        let task = self
            .queue
            .enqueue(NewTask {
                prompt: params.prompt,
                title: None,
                from,
                to,
                priority: params.priority.unwrap_or_default(),
                dependencies: params.dependencies,
                context: params.context.unwrap_or_else(|| json!({})),
            })
            .await?;

        Ok(AssignTaskResult { task_id: task.id })
    }

    async fn wait_for_task(&self, params: WaitForTaskParams) -> Result<WaitForTaskResult> {
        let timeout =
            clamp_poll_timeout(params.timeout, self.queue.config().default_poll_timeout);
        match self
            .queue
            .wait_for_completion(&params.task_id, timeout)
            .await?
        {
            Some(task) => Ok(WaitForTaskResult {
                status: task.status.to_string(),
                response: task.response,
            }),
            None => Ok(WaitForTaskResult {
                status: "TIMEOUT".to_string(),
                response: None,
            }),
        }
    }

    async fn block_task(&self, params: BlockTaskParams) -> Result<()> {
        if params.question.trim().is_empty() {
            return Err(DispatchError::empty_field("question"));
        }
        self.queue
            .block_task(
                &params.task_id,
                params.reason,
                &params.question,
                &params.summary,
                params.notes,
                params.files,
            )
            .await?;
        Ok(())
    }

    async fn answer_task(&self, params: AnswerTaskParams) -> Result<()> {
        self.queue
            .answer_task(&params.task_id, &params.answer)
            .await?;
        Ok(())
    }

    async fn get_task_context(&self, params: GetTaskContextParams) -> Result<TaskContext> {
        let task = self
            .queue
            .get_task(&params.task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(&params.task_id))?;
        let messages = self.queue.get_messages(&task.id).await?;
        let dependency_outputs = self.queue.dependency_outputs(&task).await?;

        Ok(TaskContext {
            prompt: task.prompt,
            status: task.status,
            messages,
            context: task.context,
            dependency_outputs,
        })
    }

    async fn list_agents(&self, params: ListAgentsParams) -> Result<Vec<AgentSummary>> {
        let mut agents = self.queue.agent_snapshot().await?;
        if let Some(capability) = &params.capability {
            agents.retain(|a| a.capabilities.iter().any(|c| c == capability));
        }
        Ok(agents)
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        self.queue.get_stats().await
    }

    async fn submit_review(&self, params: SubmitReviewParams) -> Result<()> {
        self.gate.authorize(params.admin_token.as_deref())?;

        let task = self
            .queue
            .get_task(&params.task_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_task(&params.task_id))?;
        if task.status != TaskStatus::InReview {
            return Err(DispatchError::validation_reason(
                "not_in_review",
                format!("task '{}' is {}", params.task_id, task.status),
            ));
        }

        let author = params.reviewer.unwrap_or_else(|| "reviewer".to_string());

        for comment in &params.comments {
            self.queue
                .store()
                .add_comment(NewReviewComment {
                    task_id: params.task_id.clone(),
                    file_path: comment.file_path.clone(),
                    line_number: comment.line_number,
                    content: comment.content.clone(),
                    author: author.clone(),
                    thread_id: comment.thread_id,
                })
                .await?;
            // Mirror into the task log so the assignee sees it as unread
            self.queue
                .store()
                .add_message(
                    &params.task_id,
                    MessageRole::User,
                    &comment.content,
                    json!({
                        "filePath": comment.file_path,
                        "lineNumber": comment.line_number,
                    }),
                    MSG_TYPE_REVIEW_COMMENT,
                    None,
                    false,
                )
                .await?;
        }

        self.queue
            .apply_review(&params.task_id, params.approved)
            .await?;
        Ok(())
    }

    async fn get_review_comments(
        &self,
        params: GetReviewCommentsParams,
    ) -> Result<Vec<ReviewComment>> {
        let comments = self
            .queue
            .store()
            .get_comments(&params.task_id, params.unresolved_only)
            .await?;
        // Fetching counts as reading the mirrored log entries
        self.queue
            .store()
            .mark_comments_read(&params.task_id)
            .await?;
        Ok(comments)
    }

    async fn resolve_review_comment(&self, params: ResolveReviewCommentParams) -> Result<()> {
        self.queue.store().resolve_comment(params.comment_id).await
    }

    async fn admin_update_agent(&self, params: AdminUpdateAgentParams) -> Result<Agent> {
        self.gate.authorize(params.admin_token.as_deref())?;

        let mut agent = self
            .queue
            .store()
            .get(&params.agent_id)
            .await?
            .ok_or_else(|| DispatchError::not_found_agent(&params.agent_id))?;

        if let Some(display_name) = params.display_name {
            DispatchValidator::validate_display_name(&display_name)?;
            agent.display_name = display_name;
        }
        if let Some(capabilities) = params.capabilities {
            for capability in &capabilities {
                DispatchValidator::validate_capability(capability)?;
            }
            agent.capabilities = capabilities;
        }
        if let Some(color) = params.color {
            agent.color = Some(color);
        }

        self.queue.store().update_agent(&agent).await?;
        Ok(agent)
    }

    async fn admin_evict_agent(&self, params: AdminEvictAgentParams) -> Result<()> {
        self.gate.authorize(params.admin_token.as_deref())?;
        let agent = self.resolve_agent(&params.agent_id).await?;
        self.queue
            .evict_agent(&agent.id, &params.reason, params.action)
            .await
    }

    async fn admin_clear_tasks(&self, params: AdminClearTasksParams) -> Result<()> {
        self.gate.authorize(params.admin_token.as_deref())?;
        self.queue.store().clear_all().await
    }

    async fn broadcast_system_prompt(
        &self,
        params: BroadcastSystemPromptParams,
    ) -> Result<BroadcastResult> {
        self.gate.authorize(params.admin_token.as_deref())?;
        let (delivered, queued) = self.queue.broadcast_system_prompt(&params.prompt).await?;
        Ok(BroadcastResult { delivered, queued })
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        self.queue.store().health_check().await?;
        Ok(HealthStatus {
            status: "healthy".to_string(),
            database: true,
            timestamp: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
