//! Fluent fixture builders for tests.

use chrono::{DateTime, Utc};
use dispatch_core::models::{
    NewAgent, NewTask, Priority, RoutingHints, Task, TaskOrigin, TaskStatus, WorkspaceContext,
    WorkspaceKind,
};

/// Builder for task fixtures.
pub struct TaskBuilder {
    prompt: String,
    from: TaskOrigin,
    to: RoutingHints,
    priority: Priority,
    dependencies: Vec<String>,
    status: Option<TaskStatus>,
    assigned_to: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl TaskBuilder {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            from: TaskOrigin::user("test-user"),
            to: RoutingHints::default(),
            priority: Priority::Normal,
            dependencies: Vec::new(),
            status: None,
            assigned_to: None,
            created_at: None,
        }
    }

    pub fn from_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.from = TaskOrigin::agent(agent_id);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn target_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.to.agent_id = Some(agent_id.into());
        self
    }

    pub fn require_capabilities(mut self, caps: &[&str]) -> Self {
        self.to.required_capabilities = caps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.to.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn depends_on(mut self, task_ids: &[&str]) -> Self {
        self.dependencies = task_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assigned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.assigned_to = Some(agent_id.into());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Build the enqueue DTO (for driving the real queue path).
    pub fn build_new(self) -> NewTask {
        NewTask {
            prompt: self.prompt,
            title: None,
            from: self.from,
            to: self.to,
            priority: self.priority,
            dependencies: self.dependencies,
            context: serde_json::json!({}),
        }
    }

    /// Build a fully-formed task (for seeding a store directly).
    pub fn build(self) -> Task {
        let status = self.status;
        let assigned_to = self.assigned_to.clone();
        let created_at = self.created_at;
        let mut task = Task::from_new(NewTask {
            prompt: self.prompt,
            title: None,
            from: self.from,
            to: self.to,
            priority: self.priority,
            dependencies: self.dependencies,
            context: serde_json::json!({}),
        });
        if let Some(status) = status {
            task.status = status;
            if status.is_terminal() {
                task.completed_at = Some(Utc::now());
            }
        }
        task.assigned_to = assigned_to;
        if let Some(at) = created_at {
            task.created_at = at;
        }
        task
    }
}

/// Builder for agent registration fixtures.
pub struct AgentBuilder {
    id: String,
    display_name: String,
    capabilities: Vec<String>,
    workspace: Option<WorkspaceContext>,
}

impl AgentBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            capabilities: Vec::new(),
            workspace: None,
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn github_workspace(mut self, repo_id: impl Into<String>) -> Self {
        self.workspace = Some(WorkspaceContext {
            kind: WorkspaceKind::Github,
            repo_id: repo_id.into(),
            branch: None,
            path: None,
        });
        self
    }

    pub fn build(self) -> NewAgent {
        NewAgent {
            id: Some(self.id),
            display_name: Some(self.display_name),
            capabilities: self.capabilities,
            color: None,
            workspace: self.workspace,
            source: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let task = TaskBuilder::new("fix the bug")
            .priority(Priority::Critical)
            .require_capabilities(&["code-writing"])
            .workspace("org/repo")
            .build();

        assert_eq!(task.priority, Priority::Critical);
        assert_eq!(task.to.required_capabilities, vec!["code-writing"]);
        assert_eq!(task.to.workspace_id.as_deref(), Some("org/repo"));
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn test_agent_builder() {
        let agent = AgentBuilder::new("agent-a")
            .display_name("Frodo")
            .capabilities(&["review"])
            .github_workspace("org/repo")
            .build();

        assert_eq!(agent.id.as_deref(), Some("agent-a"));
        assert_eq!(agent.display_name.as_deref(), Some("Frodo"));
        assert!(agent.workspace.is_some());
    }
}
