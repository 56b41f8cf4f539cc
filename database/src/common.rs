use chrono::{DateTime, Utc};
use dispatch_core::{
    error::{DispatchError, Result},
    models::{
        Agent, AgentSource, EvictionAction, MessageRole, Priority, ReviewComment, RoutingHints,
        Task, TaskMessage, TaskOrigin, TaskResponse, TaskStatus, WorkspaceContext,
    },
};
use sqlx::{sqlite::SqliteRow, Row};

/// Column list selected for every task read; keep in sync with `row_to_task`.
pub const TASK_COLUMNS: &str = "id, prompt, title, origin, routing, priority, status, \
     assigned_to, dependencies, context, response, created_at, completed_at";

/// Convert TaskStatus to its stored string form
pub fn status_to_string(status: TaskStatus) -> &'static str {
    match status {
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
    }
}

/// Convert a stored string back to TaskStatus
pub fn string_to_status(s: &str) -> Result<TaskStatus> {
    match s {
        "QUEUED" => Ok(TaskStatus::Queued),
        "PENDING_ACK" => Ok(TaskStatus::PendingAck),
        "ASSIGNED" => Ok(TaskStatus::Assigned),
        "IN_PROGRESS" => Ok(TaskStatus::InProgress),
        "IN_REVIEW" => Ok(TaskStatus::InReview),
        "APPROVED" => Ok(TaskStatus::Approved),
        "COMPLETED" => Ok(TaskStatus::Completed),
        "FAILED" => Ok(TaskStatus::Failed),
        "BLOCKED" => Ok(TaskStatus::Blocked),
        "CANCELLED" => Ok(TaskStatus::Cancelled),
        _ => Err(DispatchError::Database(format!(
            "Invalid task status in database: {s}"
        ))),
    }
}

pub fn priority_to_string(priority: Priority) -> &'static str {
    match priority {
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Critical => "critical",
    }
}

pub fn string_to_priority(s: &str) -> Result<Priority> {
    match s {
        "normal" => Ok(Priority::Normal),
        "high" => Ok(Priority::High),
        "critical" => Ok(Priority::Critical),
        _ => Err(DispatchError::Database(format!(
            "Invalid priority in database: {s}"
        ))),
    }
}

pub fn source_to_string(source: AgentSource) -> &'static str {
    match source {
        AgentSource::Cli => "CLI",
        AgentSource::Ide => "IDE",
    }
}

pub fn string_to_source(s: &str) -> Result<AgentSource> {
    match s {
        "CLI" => Ok(AgentSource::Cli),
        "IDE" => Ok(AgentSource::Ide),
        _ => Err(DispatchError::Database(format!(
            "Invalid agent source in database: {s}"
        ))),
    }
}

pub fn role_to_string(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Agent => "agent",
        MessageRole::System => "system",
    }
}

pub fn string_to_role(s: &str) -> Result<MessageRole> {
    match s {
        "user" => Ok(MessageRole::User),
        "agent" => Ok(MessageRole::Agent),
        "system" => Ok(MessageRole::System),
        _ => Err(DispatchError::Database(format!(
            "Invalid message role in database: {s}"
        ))),
    }
}

pub fn action_to_string(action: EvictionAction) -> &'static str {
    match action {
        EvictionAction::Restart => "RESTART",
        EvictionAction::Kill => "KILL",
    }
}

pub fn string_to_action(s: &str) -> Result<EvictionAction> {
    match s {
        "RESTART" => Ok(EvictionAction::Restart),
        "KILL" => Ok(EvictionAction::Kill),
        _ => Err(DispatchError::Database(format!(
            "Invalid eviction action in database: {s}"
        ))),
    }
}

/// Serialize an opaque blob column
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| DispatchError::Database(format!("Failed to serialize column: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        DispatchError::Database(format!("Invalid JSON in column '{column}': {e}"))
    })
}

/// Convert a SQLite row to a Task
pub fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let status_str: String = row.get("status");
    let priority_str: String = row.get("priority");
    let origin_raw: String = row.get("origin");
    let routing_raw: String = row.get("routing");
    let dependencies_raw: String = row.get("dependencies");
    let context_raw: String = row.get("context");
    let response_raw: Option<String> = row.get("response");

    let origin: TaskOrigin = from_json("origin", &origin_raw)?;
    let routing: RoutingHints = from_json("routing", &routing_raw)?;
    let dependencies: Vec<String> = from_json("dependencies", &dependencies_raw)?;
    let context: serde_json::Value = from_json("context", &context_raw)?;
    let response: Option<TaskResponse> = match response_raw {
        Some(raw) => Some(from_json("response", &raw)?),
        None => None,
    };

    Ok(Task {
        id: row.get("id"),
        prompt: row.get("prompt"),
        title: row.get("title"),
        from: origin,
        to: routing,
        priority: string_to_priority(&priority_str)?,
        status: string_to_status(&status_str)?,
        assigned_to: row.get("assigned_to"),
        dependencies,
        context,
        response,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
    })
}

/// Convert a SQLite row to a TaskMessage
pub fn row_to_message(row: &SqliteRow) -> Result<TaskMessage> {
    let role_str: String = row.get("role");
    let metadata_raw: String = row.get("metadata");

    Ok(TaskMessage {
        id: row.get("id"),
        task_id: row.get("task_id"),
        role: string_to_role(&role_str)?,
        content: row.get("content"),
        metadata: from_json("metadata", &metadata_raw)?,
        message_type: row.get("message_type"),
        reply_to: row.get("reply_to"),
        is_read: row.get("is_read"),
        timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
    })
}

/// Convert a SQLite row (agents joined with agent_heartbeats) to an Agent
pub fn row_to_agent(row: &SqliteRow) -> Result<Agent> {
    let capabilities_raw: String = row.get("capabilities");
    let workspace_raw: Option<String> = row.get("workspace");
    let source_str: String = row.get("source");
    let created_at: DateTime<Utc> = row.get("created_at");
    let last_seen: Option<DateTime<Utc>> = row.get("last_seen");

    let workspace: Option<WorkspaceContext> = match workspace_raw {
        Some(raw) => Some(from_json("workspace", &raw)?),
        None => None,
    };

    Ok(Agent {
        id: row.get("id"),
        display_name: row.get("display_name"),
        capabilities: from_json("capabilities", &capabilities_raw)?,
        color: row.get("color"),
        workspace,
        source: string_to_source(&source_str)?,
        created_at,
        last_seen: last_seen.unwrap_or(created_at),
    })
}

/// Convert a SQLite row to a ReviewComment
pub fn row_to_review_comment(row: &SqliteRow) -> Result<ReviewComment> {
    Ok(ReviewComment {
        id: row.get("id"),
        task_id: row.get("task_id"),
        file_path: row.get("file_path"),
        line_number: row.get("line_number"),
        content: row.get("content"),
        author: row.get("author"),
        thread_id: row.get("thread_id"),
        resolved: row.get("resolved"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    })
}

/// Convert a SQLx error to a DispatchError
pub fn sqlx_error_to_dispatch_error(err: sqlx::Error) -> DispatchError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("UNIQUE constraint failed") {
                if message.contains("agents.display_name")
                    || message.contains("idx_agents_display_name")
                {
                    return DispatchError::DuplicateDisplayName(message.to_string());
                }
                DispatchError::Validation(format!("Unique constraint violated: {message}"))
            } else {
                DispatchError::Database(format!("Database constraint error: {message}"))
            }
        }
        sqlx::Error::RowNotFound => DispatchError::NotFound("Row not found".to_string()),
        _ => DispatchError::Database(format!("Database error: {err}")),
    }
}
