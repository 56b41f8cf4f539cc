use crate::{
    error::Result,
    models::{
        Agent, AgentSummary, ControlSignal, EvictionAction, Priority, ReviewComment, RoutingHints,
        TaskMessage, TaskOrigin, TaskResponse, TaskStatus, WorkspaceContext,
    },
    repository::QueueStats,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol handler trait for the dispatch RPC surface.
///
/// One method per RPC operation; parameter types carry the wire shapes.
/// Implementations sit between the transport and the task queue and do
/// request-level validation only; queue semantics live in the queue.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn register_agent(&self, params: RegisterAgentParams) -> Result<RegisterAgentResult>;

    /// Long-poll for work. Returns a task, a control signal, or the
    /// TIMEOUT sentinel; a timeout is a successful response, not an error.
    async fn wait_for_prompt(&self, params: WaitForPromptParams) -> Result<WaitForPromptResult>;

    async fn ack_task(&self, params: AckTaskParams) -> Result<()>;

    async fn send_response(&self, params: SendResponseParams) -> Result<()>;

    async fn update_progress(&self, params: UpdateProgressParams) -> Result<()>;

    /// Enqueue on behalf of a producer; fires a `delegation` event when the
    /// producer is another agent.
    async fn assign_task(&self, params: AssignTaskParams) -> Result<AssignTaskResult>;

    /// Block until the named task reaches a terminal state, or time out.
    async fn wait_for_task(&self, params: WaitForTaskParams) -> Result<WaitForTaskResult>;

    async fn block_task(&self, params: BlockTaskParams) -> Result<()>;

    async fn answer_task(&self, params: AnswerTaskParams) -> Result<()>;

    async fn get_task_context(&self, params: GetTaskContextParams) -> Result<TaskContext>;

    async fn list_agents(&self, params: ListAgentsParams) -> Result<Vec<AgentSummary>>;

    async fn get_stats(&self) -> Result<QueueStats>;

    async fn submit_review(&self, params: SubmitReviewParams) -> Result<()>;

    async fn get_review_comments(
        &self,
        params: GetReviewCommentsParams,
    ) -> Result<Vec<ReviewComment>>;

    async fn resolve_review_comment(&self, params: ResolveReviewCommentParams) -> Result<()>;

    // Admin surface (token-gated)

    async fn admin_update_agent(&self, params: AdminUpdateAgentParams) -> Result<Agent>;

    async fn admin_evict_agent(&self, params: AdminEvictAgentParams) -> Result<()>;

    async fn admin_clear_tasks(&self, params: AdminClearTasksParams) -> Result<()>;

    async fn broadcast_system_prompt(
        &self,
        params: BroadcastSystemPromptParams,
    ) -> Result<BroadcastResult>;

    async fn health_check(&self) -> Result<HealthStatus>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentParams {
    pub id: Option<String>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub workspace_context: Option<WorkspaceContext>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentResult {
    pub id: String,
    pub display_name: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForPromptParams {
    pub agent_id: String,
    /// Milliseconds; clamped to [1s, 300s], default 290s
    pub timeout: Option<u64>,
}

/// Outcome of a long-poll: a task, a control signal, or the timeout
/// sentinel.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WaitForPromptResult {
    #[serde(rename_all = "camelCase")]
    Task {
        task_id: String,
        prompt: String,
        from: TaskOrigin,
        priority: Priority,
        context: Value,
    },
    Control(ControlSignal),
    Timeout { status: TimeoutSentinel },
}

/// The literal `"TIMEOUT"` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSentinel;

impl Serialize for TimeoutSentinel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("TIMEOUT")
    }
}

impl WaitForPromptResult {
    pub fn timeout() -> Self {
        WaitForPromptResult::Timeout {
            status: TimeoutSentinel,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckTaskParams {
    pub task_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponseParams {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub diff: Option<String>,
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProgressParams {
    pub task_id: String,
    pub agent_id: String,
    pub phase: Option<String>,
    pub message: String,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTaskParams {
    pub prompt: String,
    pub workspace_id: String,
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub priority: Option<Priority>,
    pub context: Option<Value>,
    /// Present when another agent is delegating
    pub source_agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTaskResult {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForTaskParams {
    pub task_id: String,
    /// Milliseconds; clamped like the long-poll timeout
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForTaskResult {
    /// Terminal status name, or `"TIMEOUT"`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<TaskResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTaskParams {
    pub task_id: String,
    pub reason: BlockReason,
    pub question: String,
    pub summary: String,
    pub notes: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlockReason {
    Clarification,
    Dependency,
    Decision,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Clarification => write!(f, "clarification"),
            BlockReason::Dependency => write!(f, "dependency"),
            BlockReason::Decision => write!(f, "decision"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerTaskParams {
    pub task_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskContextParams {
    pub task_id: String,
}

/// Everything an agent (or dashboard) needs to resume reasoning about a
/// task: prompt, live status, the message log, and injected dependency
/// outputs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub prompt: String,
    pub status: TaskStatus,
    pub messages: Vec<TaskMessage>,
    pub context: Value,
    pub dependency_outputs: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListAgentsParams {
    pub capability: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReviewParams {
    pub task_id: String,
    pub approved: bool,
    pub reviewer: Option<String>,
    #[serde(default)]
    pub comments: Vec<ReviewCommentInput>,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCommentInput {
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub content: String,
    pub thread_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetReviewCommentsParams {
    pub task_id: String,
    #[serde(default)]
    pub unresolved_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveReviewCommentParams {
    pub comment_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUpdateAgentParams {
    pub agent_id: String,
    pub display_name: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub color: Option<String>,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminEvictAgentParams {
    pub agent_id: String,
    pub reason: String,
    pub action: EvictionAction,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdminClearTasksParams {
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSystemPromptParams {
    pub prompt: String,
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResult {
    /// Agents that received the prompt through a live long-poll channel
    pub delivered: u32,
    /// Agents for which the prompt was stored for their next poll
    pub queued: u32,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub database: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            status: "unknown".to_string(),
            database: false,
            timestamp: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Routing hints assembled from `assign_task` parameters.
impl AssignTaskParams {
    pub fn routing_hints(&self) -> RoutingHints {
        RoutingHints {
            agent_id: self.target_agent_id.clone(),
            required_capabilities: self.required_capabilities.clone(),
            workspace_id: if self.workspace_id.is_empty() {
                None
            } else {
                Some(self.workspace_id.clone())
            },
        }
    }
}
