use crate::common::{
    action_to_string, priority_to_string, role_to_string, row_to_agent, row_to_message,
    row_to_review_comment, row_to_task, source_to_string, sqlx_error_to_dispatch_error,
    status_to_string, string_to_action, string_to_status, to_json, TASK_COLUMNS,
};
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
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

/// SQLite implementation of the dispatch store.
///
/// One pooled connection set backs every repository trait, the way one
/// database file backs every table. WAL journaling for file-backed stores,
/// `:memory:` supported for tests.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if necessary) the store at the given URL.
    ///
    /// Accepts `sqlite://...` URLs, bare file paths, and `:memory:`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let db_url = if database_url.starts_with(":memory:") {
            database_url.to_string()
        } else if database_url.starts_with("sqlite://") {
            database_url.to_string()
        } else {
            format!("sqlite://{database_url}")
        };

        if !db_url.contains(":memory:") && !Sqlite::database_exists(&db_url).await.unwrap_or(false)
        {
            Sqlite::create_database(&db_url).await.map_err(|e| {
                DispatchError::Database(format!("Failed to create database: {e}"))
            })?;
            tracing::info!(url = %db_url, "Database created");
        }

        let connect_options = if db_url.contains(":memory:") {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&db_url)
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Memory)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        } else {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_url.replace("sqlite://", ""))
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        };

        let pool = SqlitePool::connect_with(connect_options)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        Ok(Self { pool })
    }

    /// Apply pending migrations. Call once after opening.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| DispatchError::Database(format!("Migration failed: {e}")))?;

        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Direct pool access, primarily for tests that need raw SQL.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn task_exists(&self, task_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?)")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;
        Ok(exists)
    }

    async fn agent_exists(&self, agent_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM agents WHERE id = ?)")
            .bind(agent_id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;
        Ok(exists)
    }
}

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn insert(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, prompt, title, origin, routing, priority, status,
                               assigned_to, dependencies, context, response, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.prompt)
        .bind(&task.title)
        .bind(to_json(&task.from)?)
        .bind(to_json(&task.to)?)
        .bind(priority_to_string(task.priority))
        .bind(status_to_string(task.status))
        .bind(&task.assigned_to)
        .bind(to_json(&task.dependencies)?)
        .bind(to_json(&task.context)?)
        .bind(match &task.response {
            Some(r) => Some(to_json(r)?),
            None => None,
        })
        .bind(task.created_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        Ok(())
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET prompt = ?, title = ?, origin = ?, routing = ?, priority = ?, status = ?,
                assigned_to = ?, dependencies = ?, context = ?, response = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&task.prompt)
        .bind(&task.title)
        .bind(to_json(&task.from)?)
        .bind(to_json(&task.to)?)
        .bind(priority_to_string(task.priority))
        .bind(status_to_string(task.status))
        .bind(&task.assigned_to)
        .bind(to_json(&task.dependencies)?)
        .bind(to_json(&task.context)?)
        .bind(match &task.response {
            Some(r) => Some(to_json(r)?),
            None => None,
        })
        .bind(task.completed_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found_task(&task.id));
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        // Single atomic write: completed_at is stamped exactly when a task
        // first enters a terminal state.
        let query = format!(
            "UPDATE tasks SET status = ?, \
             completed_at = CASE WHEN ? AND completed_at IS NULL THEN ? ELSE completed_at END \
             WHERE id = ? RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(status_to_string(status))
            .bind(status.is_terminal())
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        match row {
            Some(row) => row_to_task(&row),
            None => Err(DispatchError::not_found_task(id)),
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        match row {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let query =
            format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY created_at ASC");
        let rows = sqlx::query(&query)
            .bind(status_to_string(status))
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn get_by_statuses(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: sqlx::QueryBuilder<Sqlite> = sqlx::QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ("
        ));
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status_to_string(*status));
        }
        builder.push(") ORDER BY created_at ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn get_by_assigned_to(&self, agent_id: &str) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE assigned_to = ? ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&query)
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn get_active(&self) -> Result<Vec<Task>> {
        self.get_by_statuses(&TaskStatus::active_set()).await
    }

    async fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<Task>> {
        let mut builder: sqlx::QueryBuilder<Sqlite> =
            sqlx::QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"));

        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status_to_string(status));
        }
        if let Some(agent_id) = &filter.agent_id {
            builder.push(" AND assigned_to = ");
            builder.push_bind(agent_id);
        }

        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(50) as i64);
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset.unwrap_or(0) as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        let (total_result, state_results) = tokio::join!(
            sqlx::query("SELECT COUNT(*) as total FROM tasks").fetch_one(&self.pool),
            sqlx::query("SELECT status, COUNT(*) as count FROM tasks GROUP BY status")
                .fetch_all(&self.pool),
        );

        let total_row = total_result.map_err(sqlx_error_to_dispatch_error)?;
        let state_rows = state_results.map_err(sqlx_error_to_dispatch_error)?;

        let total: i64 = total_row.get("total");

        let mut by_status = HashMap::new();
        for row in state_rows {
            let status_str: String = row.get("status");
            let status = string_to_status(&status_str)?;
            let count: i64 = row.get("count");
            by_status.insert(status, count as u64);
        }
        let completed = by_status.get(&TaskStatus::Completed).copied().unwrap_or(0);

        Ok(QueueStats {
            total: total as u64,
            by_status,
            completed,
        })
    }

    async fn clear_all(&self) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        for table in ["task_messages", "review_comments", "tasks"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_dispatch_error)?;
        }

        tx.commit().await.map_err(sqlx_error_to_dispatch_error)?;
        tracing::info!("Cleared all tasks, messages, and review comments");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;
        Ok(())
    }
}

#[async_trait]
impl TaskMessageRepository for SqliteStore {
    async fn add_message(
        &self,
        task_id: &str,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Value,
        message_type: &str,
        reply_to: Option<i64>,
        is_read: bool,
    ) -> Result<TaskMessage> {
        if !self.task_exists(task_id).await? {
            return Err(DispatchError::not_found_task(task_id));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO task_messages (task_id, role, content, metadata, message_type, reply_to, is_read, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, task_id, role, content, metadata, message_type, reply_to, is_read, timestamp
            "#,
        )
        .bind(task_id)
        .bind(role_to_string(role))
        .bind(content)
        .bind(to_json(&metadata)?)
        .bind(message_type)
        .bind(reply_to)
        .bind(is_read)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        row_to_message(&row)
    }

    async fn get_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        let rows = sqlx::query(
            "SELECT id, task_id, role, content, metadata, message_type, reply_to, is_read, timestamp \
             FROM task_messages WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        rows.iter().map(row_to_message).collect()
    }

    async fn get_unread_comments(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        let rows = sqlx::query(
            "SELECT id, task_id, role, content, metadata, message_type, reply_to, is_read, timestamp \
             FROM task_messages WHERE task_id = ? AND message_type = 'review_comment' AND is_read = 0 \
             ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        rows.iter().map(row_to_message).collect()
    }

    async fn mark_comments_read(&self, task_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE task_messages SET is_read = 1 \
             WHERE task_id = ? AND message_type = 'review_comment'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;
        Ok(())
    }

    async fn last_progress_at(&self, task_id: &str) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(timestamp) FROM task_messages \
             WHERE task_id = ? AND json_extract(metadata, '$.percentage') IS NOT NULL",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        Ok(latest)
    }
}

#[async_trait]
impl AgentRepository for SqliteStore {
    async fn register(&self, new: NewAgent) -> Result<Agent> {
        let id = new
            .id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("agent-{}", Utc::now().timestamp_millis()));
        let display_name = new
            .display_name
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| id.clone());

        // Reject a display name already held by a different id; the unique
        // NOCASE index backstops this against concurrent registrations.
        let holder: Option<String> =
            sqlx::query_scalar("SELECT id FROM agents WHERE lower(display_name) = ?")
                .bind(normalize_alias(&display_name))
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlx_error_to_dispatch_error)?;
        if let Some(holder) = holder {
            if holder != id {
                return Err(DispatchError::DuplicateDisplayName(display_name));
            }
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO agents (id, display_name, capabilities, color, workspace, source, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                capabilities = excluded.capabilities,
                color = excluded.color,
                workspace = excluded.workspace,
                source = excluded.source
            "#,
        )
        .bind(&id)
        .bind(display_name.trim())
        .bind(to_json(&new.capabilities)?)
        .bind(&new.color)
        .bind(match &new.workspace {
            Some(w) => Some(to_json(w)?),
            None => None,
        })
        .bind(source_to_string(new.source))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        sqlx::query(
            "INSERT INTO agent_heartbeats (agent_id, last_seen) VALUES (?, ?) \
             ON CONFLICT(agent_id) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(&id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        self.get(&id)
            .await?
            .ok_or_else(|| DispatchError::not_found_agent(&id))
    }

    async fn get(&self, id: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT a.id, a.display_name, a.capabilities, a.color, a.workspace, a.source, \
                    a.created_at, h.last_seen \
             FROM agents a LEFT JOIN agent_heartbeats h ON h.agent_id = a.id \
             WHERE a.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        match row {
            Some(row) => Ok(Some(row_to_agent(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_by_display_name(&self, name: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT a.id, a.display_name, a.capabilities, a.color, a.workspace, a.source, \
                    a.created_at, h.last_seen \
             FROM agents a LEFT JOIN agent_heartbeats h ON h.agent_id = a.id \
             WHERE lower(a.display_name) = ?",
        )
        .bind(normalize_alias(name))
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        match row {
            Some(row) => Ok(Some(row_to_agent(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT a.id, a.display_name, a.capabilities, a.color, a.workspace, a.source, \
                    a.created_at, h.last_seen \
             FROM agents a LEFT JOIN agent_heartbeats h ON h.agent_id = a.id \
             ORDER BY a.created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        rows.iter().map(row_to_agent).collect()
    }

    async fn by_capability(&self, capability: &str) -> Result<Vec<Agent>> {
        // Capability tags live inside a JSON array column; the agent table
        // is small, so decode and filter here rather than in SQL.
        let agents = self.list().await?;
        Ok(agents
            .into_iter()
            .filter(|a| a.capabilities.iter().any(|c| c == capability))
            .collect())
    }

    async fn heartbeat(&self, id: &str) -> Result<()> {
        if !self.agent_exists(id).await? {
            return Err(DispatchError::not_found_agent(id));
        }
        sqlx::query(
            "INSERT INTO agent_heartbeats (agent_id, last_seen) VALUES (?, ?) \
             ON CONFLICT(agent_id) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;
        Ok(())
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        let holder: Option<String> =
            sqlx::query_scalar("SELECT id FROM agents WHERE lower(display_name) = ?")
                .bind(normalize_alias(&agent.display_name))
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlx_error_to_dispatch_error)?;
        if let Some(holder) = holder {
            if holder != agent.id {
                return Err(DispatchError::DuplicateDisplayName(
                    agent.display_name.clone(),
                ));
            }
        }

        let result = sqlx::query(
            "UPDATE agents SET display_name = ?, capabilities = ?, color = ?, workspace = ?, source = ? \
             WHERE id = ?",
        )
        .bind(&agent.display_name)
        .bind(to_json(&agent.capabilities)?)
        .bind(&agent.color)
        .bind(match &agent.workspace {
            Some(w) => Some(to_json(w)?),
            None => None,
        })
        .bind(source_to_string(agent.source))
        .bind(&agent.id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found_agent(&agent.id));
        }
        Ok(())
    }

    async fn request_eviction(
        &self,
        id: &str,
        reason: &str,
        action: EvictionAction,
    ) -> Result<()> {
        if !self.agent_exists(id).await? {
            return Err(DispatchError::not_found_agent(id));
        }
        sqlx::query(
            "INSERT INTO eviction_requests (agent_id, reason, action, requested_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(agent_id) DO UPDATE SET reason = excluded.reason, \
                 action = excluded.action, requested_at = excluded.requested_at",
        )
        .bind(id)
        .bind(reason)
        .bind(action_to_string(action))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;
        Ok(())
    }

    async fn check_eviction(&self, id: &str) -> Result<Option<EvictionRequest>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        let row = sqlx::query(
            "SELECT agent_id, reason, action, requested_at FROM eviction_requests WHERE agent_id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        let request = match row {
            Some(row) => {
                let action_str: String = row.get("action");
                Some(EvictionRequest {
                    agent_id: row.get("agent_id"),
                    reason: row.get("reason"),
                    action: string_to_action(&action_str)?,
                    requested_at: row.get::<DateTime<Utc>, _>("requested_at"),
                })
            }
            None => None,
        };

        if request.is_some() {
            sqlx::query("DELETE FROM eviction_requests WHERE agent_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(sqlx_error_to_dispatch_error)?;
        }

        tx.commit().await.map_err(sqlx_error_to_dispatch_error)?;
        Ok(request)
    }

    async fn cleanup_stale(&self, stale_before: DateTime<Utc>, keep: &[String]) -> Result<u64> {
        let rows = sqlx::query("SELECT agent_id FROM agent_heartbeats WHERE last_seen < ?")
            .bind(stale_before)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        let mut removed = 0u64;
        for row in rows {
            let agent_id: String = row.get("agent_id");
            if keep.contains(&agent_id) {
                continue;
            }
            let result = sqlx::query("DELETE FROM agents WHERE id = ?")
                .bind(&agent_id)
                .execute(&self.pool)
                .await
                .map_err(sqlx_error_to_dispatch_error)?;
            removed += result.rows_affected();
        }

        if removed > 0 {
            tracing::info!(removed, "Cleaned up stale agents");
        }
        Ok(removed)
    }
}

#[async_trait]
impl ReviewCommentRepository for SqliteStore {
    async fn add_comment(&self, comment: NewReviewComment) -> Result<ReviewComment> {
        if !self.task_exists(&comment.task_id).await? {
            return Err(DispatchError::not_found_task(&comment.task_id));
        }
        if comment.content.trim().is_empty() {
            return Err(DispatchError::empty_field("content"));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO review_comments (task_id, file_path, line_number, content, author, thread_id, resolved, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            RETURNING id, task_id, file_path, line_number, content, author, thread_id, resolved, created_at
            "#,
        )
        .bind(&comment.task_id)
        .bind(&comment.file_path)
        .bind(comment.line_number)
        .bind(&comment.content)
        .bind(&comment.author)
        .bind(comment.thread_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_dispatch_error)?;

        row_to_review_comment(&row)
    }

    async fn get_comments(
        &self,
        task_id: &str,
        unresolved_only: bool,
    ) -> Result<Vec<ReviewComment>> {
        let mut builder: sqlx::QueryBuilder<Sqlite> = sqlx::QueryBuilder::new(
            "SELECT id, task_id, file_path, line_number, content, author, thread_id, resolved, created_at \
             FROM review_comments WHERE task_id = ",
        );
        builder.push_bind(task_id);
        if unresolved_only {
            builder.push(" AND resolved = 0");
        }
        builder.push(" ORDER BY id ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        rows.iter().map(row_to_review_comment).collect()
    }

    async fn resolve_comment(&self, comment_id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE review_comments SET resolved = 1 WHERE id = ?")
            .bind(comment_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_dispatch_error)?;

        if result.rows_affected() == 0 {
            return Err(DispatchError::NotFound(format!(
                "Review comment {comment_id} not found"
            )));
        }
        Ok(())
    }
}
