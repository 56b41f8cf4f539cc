use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of an auto-derived task title.
pub const MAX_TITLE_LEN: usize = 80;

/// Core task representation in the dispatch server.
///
/// A task carries a free-form prompt from a producer (a human operator or a
/// delegating agent) through the queue to exactly one executing agent. Its
/// lifecycle is governed by a fixed state machine; see [`TaskStatus`] and
/// [`Task::can_transition_to`].
///
/// # Examples
///
/// ```rust
/// use dispatch_core::models::{NewTask, Task, TaskOrigin, TaskStatus};
///
/// let new_task = NewTask::from_user("operator", "Add login page\nwith OAuth");
/// let task = Task::from_new(new_task);
///
/// assert_eq!(task.status, TaskStatus::Queued);
/// assert_eq!(task.title.as_deref(), Some("Add login page"));
/// assert!(task.can_transition_to(TaskStatus::PendingAck));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Opaque stable identifier, unique across the store
    pub id: String,
    /// Free-form work description handed to the agent
    pub prompt: String,
    /// Short human label; derived from the prompt's first line when absent
    pub title: Option<String>,
    /// Origin descriptor (who enqueued this)
    pub from: TaskOrigin,
    /// Routing hints constraining which agents are eligible
    #[serde(default)]
    pub to: RoutingHints,
    /// Scheduling priority
    pub priority: Priority,
    /// Current lifecycle state
    pub status: TaskStatus,
    /// Agent id once acknowledged; kept on terminal states for attribution
    pub assigned_to: Option<String>,
    /// Task ids that must be COMPLETED before this task may leave BLOCKED
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Opaque key-value payload; `dependencyOutputs` is injected when served
    #[serde(default = "empty_object")]
    pub context: Value,
    /// Terminal result reported by the agent
    pub response: Option<TaskResponse>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Set exactly when the task enters COMPLETED, FAILED, or CANCELLED
    pub completed_at: Option<DateTime<Utc>>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Task lifecycle states.
///
/// The normal flow is Queued → PendingAck → Assigned → InProgress →
/// (InReview → Approved →) Completed. Blocked is recoverable; Completed,
/// Failed and Cancelled are terminal. `forceRetry` is the only operation
/// allowed to step outside this machine (from any non-Completed state back
/// to Queued).
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting in the queue for an eligible agent
    Queued,
    /// Delivered to an agent, acknowledgement outstanding
    PendingAck,
    /// Acknowledged by the agent, work not yet started
    Assigned,
    /// Agent has reported progress
    InProgress,
    /// Agent submitted the result for review
    InReview,
    /// Review approved, terminal response outstanding
    Approved,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Waiting on dependencies or on a clarification answer
    Blocked,
    /// Cancelled by an operator
    Cancelled,
}

impl TaskStatus {
    /// All states a stored task can be in.
    pub const ALL: [TaskStatus; 10] = [
        TaskStatus::Queued,
        TaskStatus::PendingAck,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::Approved,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
        TaskStatus::Cancelled,
    ];

    /// Terminal set: once reached the task never changes state again
    /// (except Cancelled being idempotently re-cancelled).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// States in which an agent is accountable for the task.
    pub fn is_active_assignment(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    /// The non-terminal states, as queried by `get_active`.
    pub fn active_set() -> Vec<TaskStatus> {
        TaskStatus::ALL
            .iter()
            .copied()
            .filter(|s| !s.is_terminal())
            .collect()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::PendingAck => "PENDING_ACK",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::InReview => "IN_REVIEW",
            TaskStatus::Approved => "APPROVED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Scheduling priority. Ordering is significant: `Critical > High > Normal`.
#[derive(
    Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Who enqueued a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskOrigin {
    pub kind: OriginKind,
    /// Producer identifier (user id, agent id, or "system")
    pub id: String,
    pub display_name: Option<String>,
}

impl TaskOrigin {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: OriginKind::User,
            id: id.into(),
            display_name: None,
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: OriginKind::Agent,
            id: id.into(),
            display_name: None,
        }
    }

    pub fn system() -> Self {
        Self {
            kind: OriginKind::System,
            id: "system".to_string(),
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OriginKind {
    User,
    Agent,
    System,
}

/// Routing hints: constraints a task places on which agent may serve it.
///
/// All fields are optional; an empty hint set matches every agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHints {
    /// Pin to a specific agent id
    pub agent_id: Option<String>,
    /// Every listed capability must be advertised by the serving agent
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Repository identity the agent must be operating against
    pub workspace_id: Option<String>,
}

/// Terminal result of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub message: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub diff: Option<String>,
}

/// Data transfer object for enqueueing a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub prompt: String,
    pub title: Option<String>,
    pub from: TaskOrigin,
    #[serde(default)]
    pub to: RoutingHints,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "empty_object")]
    pub context: Value,
}

impl NewTask {
    /// Create a plain user-originated task with no routing constraints.
    pub fn from_user(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            title: None,
            from: TaskOrigin::user(user_id),
            to: RoutingHints::default(),
            priority: Priority::Normal,
            dependencies: Vec::new(),
            context: empty_object(),
        }
    }
}

impl Task {
    /// Materialize a task from its enqueue DTO: fresh id, derived title,
    /// initial Queued state and creation timestamp.
    pub fn from_new(new: NewTask) -> Self {
        let title = new
            .title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| derive_title(&new.prompt));
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4().simple()),
            prompt: new.prompt,
            title,
            from: new.from,
            to: new.to,
            priority: new.priority,
            status: TaskStatus::Queued,
            assigned_to: None,
            dependencies: new.dependencies,
            context: normalize_context(new.context),
            response: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Check if the task may transition to the given state.
    ///
    /// Covers every regular operation; `forceRetry` deliberately bypasses
    /// it.
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self.status, new_status) {
            // Repeated progress reports are fine; every other self-loop is not
            (InProgress, InProgress) => true,
            (current, new) if current == new => false,

            (Queued, PendingAck | Blocked | Cancelled) => true,

            (PendingAck, Assigned | Queued | Cancelled) => true,

            (Assigned, InProgress | Completed | Failed | Blocked | Queued | Cancelled) => true,

            (InProgress, InReview | Completed | Failed | Blocked | Queued | Cancelled) => true,

            // Approve, or send the assignee back to address review comments
            (InReview, Approved | InProgress | Queued | Cancelled) => true,

            (Approved, Completed | Failed | Blocked | Queued | Cancelled) => true,

            // Recoverable: answered clarification or satisfied dependencies
            (Blocked, Queued | Cancelled) => true,

            // Terminal states never move
            (Completed | Failed | Cancelled, _) => false,

            _ => false,
        }
    }

    /// Whether every routing field is unset (task matches any agent).
    pub fn is_unrouted(&self) -> bool {
        self.to.agent_id.is_none()
            && self.to.required_capabilities.is_empty()
            && self.to.workspace_id.is_none()
    }
}

/// Derive a title from the first line of a prompt: trimmed, truncated to
/// [`MAX_TITLE_LEN`] characters with a `…` marker.
pub fn derive_title(prompt: &str) -> Option<String> {
    let first = prompt.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    let mut title: String = first.chars().take(MAX_TITLE_LEN).collect();
    if first.chars().count() > MAX_TITLE_LEN {
        title.push('…');
    }
    Some(title)
}

fn normalize_context(ctx: Value) -> Value {
    match ctx {
        Value::Object(_) => ctx,
        Value::Null => empty_object(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            Value::Object(map)
        }
    }
}

/// Append-only log entry attached to a task.
///
/// Progress observations carry `metadata.percentage`; review comments carry
/// `metadata.filePath` + `metadata.lineNumber`; block events carry
/// `metadata.type == "block_event"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: i64,
    pub task_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    pub message_type: String,
    pub reply_to: Option<i64>,
    pub is_read: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Agent => write!(f, "agent"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Message type for recorded status transitions; the task's status history
/// is reconstructed from messages of this type.
pub const MSG_TYPE_STATUS_CHANGE: &str = "status_change";
/// Message type for agent progress observations.
pub const MSG_TYPE_PROGRESS: &str = "progress";
/// Message type for block events.
pub const MSG_TYPE_BLOCK_EVENT: &str = "block_event";
/// Message type for review comments mirrored into the task log.
pub const MSG_TYPE_REVIEW_COMMENT: &str = "review_comment";
/// Message type for user clarification answers.
pub const MSG_TYPE_ANSWER: &str = "answer";

/// A registered coding agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    /// Unique across agents (case-insensitive); usable as an `@alias`
    pub display_name: String,
    /// Free-form capability tags, e.g. `code-writing`, `review`
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub color: Option<String>,
    pub workspace: Option<WorkspaceContext>,
    pub source: AgentSource,
    pub created_at: DateTime<Utc>,
    /// Refreshed on every interaction with the server
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentSource {
    #[default]
    Cli,
    Ide,
}

/// Repository identity an agent operates against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceContext {
    #[serde(rename = "type")]
    pub kind: WorkspaceKind,
    pub repo_id: String,
    pub branch: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Local,
    Github,
}

/// Data transfer object for registering (or re-registering) an agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewAgent {
    /// Missing id is auto-assigned as `agent-<millis>`
    pub id: Option<String>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub color: Option<String>,
    pub workspace: Option<WorkspaceContext>,
    #[serde(default)]
    pub source: AgentSource,
}

/// Non-task payload delivered through a long-poll channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "controlSignal", content = "payload")]
pub enum ControlSignal {
    #[serde(rename = "EVICT")]
    Evict {
        reason: String,
        action: EvictionAction,
    },
    #[serde(rename = "SYSTEM_PROMPT")]
    SystemPrompt { prompt: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionAction {
    Restart,
    Kill,
}

impl std::fmt::Display for EvictionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionAction::Restart => write!(f, "RESTART"),
            EvictionAction::Kill => write!(f, "KILL"),
        }
    }
}

/// A stored pending control signal for an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvictionRequest {
    pub agent_id: String,
    pub reason: String,
    pub action: EvictionAction,
    pub requested_at: DateTime<Utc>,
}

/// Filter for the task history listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    pub status: Option<TaskStatus>,
    pub agent_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// A persisted review comment on a task in review.
///
/// Comments with no `thread_id` are thread roots; replies carry the root's
/// comment id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewComment {
    pub id: i64,
    pub task_id: String,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub content: String,
    pub author: String,
    pub thread_id: Option<i64>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

/// Data transfer object for posting a review comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReviewComment {
    pub task_id: String,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub content: String,
    pub author: String,
    pub thread_id: Option<i64>,
}

/// Externally visible agent status, derived from the waiting registry and
/// the agent's active assignments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentActivity {
    Offline,
    Waiting,
    Processing,
}

/// One row of the `list_agents` / `agent:list` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub status: AgentActivity,
    pub current_task: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_task() -> Task {
        Task::from_new(NewTask::from_user("u1", "do the thing"))
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = queued_task();
        assert_eq!(task.status, TaskStatus::Queued);

        for next in [
            TaskStatus::PendingAck,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Approved,
            TaskStatus::Completed,
        ] {
            assert!(
                task.can_transition_to(next),
                "expected {} -> {next} to be legal",
                task.status
            );
            task.status = next;
        }

        // Completed is terminal
        for next in TaskStatus::ALL {
            assert!(!task.can_transition_to(next));
        }
    }

    #[test]
    fn test_terminal_states_never_move() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            let mut task = queued_task();
            task.status = terminal;
            for next in TaskStatus::ALL {
                assert!(!task.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_blocked_is_recoverable() {
        let mut task = queued_task();
        task.status = TaskStatus::Blocked;
        assert!(task.can_transition_to(TaskStatus::Queued));
        assert!(task.can_transition_to(TaskStatus::Cancelled));
        assert!(!task.can_transition_to(TaskStatus::Assigned));
        assert!(!task.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_repeated_progress_is_legal() {
        let mut task = queued_task();
        task.status = TaskStatus::InProgress;
        assert!(task.can_transition_to(TaskStatus::InProgress));

        task.status = TaskStatus::Assigned;
        assert!(!task.can_transition_to(TaskStatus::Assigned));
    }

    #[test]
    fn test_review_path() {
        let mut task = queued_task();
        task.status = TaskStatus::InReview;
        assert!(task.can_transition_to(TaskStatus::Approved));
        // Changes requested sends the assignee back to work
        assert!(task.can_transition_to(TaskStatus::InProgress));
        assert!(!task.can_transition_to(TaskStatus::Completed));

        task.status = TaskStatus::Approved;
        assert!(task.can_transition_to(TaskStatus::Completed));
        assert!(task.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);

        let mut priorities = vec![Priority::Normal, Priority::Critical, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Normal, Priority::High, Priority::Critical]
        );
    }

    #[test]
    fn test_derive_title_truncates() {
        let long = "x".repeat(200);
        let title = derive_title(&long).unwrap();
        assert_eq!(title.chars().count(), MAX_TITLE_LEN + 1);
        assert!(title.ends_with('…'));

        assert_eq!(derive_title("  short  \nrest"), Some("short".to_string()));
        assert_eq!(derive_title("   \n"), None);
        assert_eq!(derive_title(""), None);
    }

    #[test]
    fn test_from_new_prefers_explicit_title() {
        let mut new = NewTask::from_user("u1", "first line\nsecond");
        new.title = Some("Custom".to_string());
        let task = Task::from_new(new);
        assert_eq!(task.title.as_deref(), Some("Custom"));
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&TaskStatus::PendingAck).unwrap();
        assert_eq!(json, "\"PENDING_ACK\"");
        let back: TaskStatus = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(back, TaskStatus::InProgress);
    }

    #[test]
    fn test_control_signal_wire_format() {
        let signal = ControlSignal::Evict {
            reason: "maintenance".to_string(),
            action: EvictionAction::Restart,
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["controlSignal"], "EVICT");
        assert_eq!(json["payload"]["action"], "RESTART");
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::from_new(NewTask::from_user("u", "p"));
        let b = Task::from_new(NewTask::from_user("u", "p"));
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("task-"));
    }
}
