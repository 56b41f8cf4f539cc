//! Task-to-agent eligibility and dispatch ordering.

use dispatch_core::models::{Task, WorkspaceContext};

/// Eligibility of a queued task for an agent.
///
/// - A pinned `to.agentId` must equal the agent's id.
/// - Otherwise a non-empty `to.requiredCapabilities` must be a subset of
///   the agent's capabilities.
/// - Otherwise any agent qualifies.
/// - A `to.workspaceId` is compared against the agent's repo id only when
///   both sides are present; a missing side never filters.
///
/// Dependency readiness is a separate, store-backed check; this predicate
/// covers the agent-shaped constraints only.
pub fn agent_matches_task(
    task: &Task,
    agent_id: &str,
    capabilities: &[String],
    workspace: Option<&WorkspaceContext>,
) -> bool {
    if let Some(target) = &task.to.agent_id {
        if target != agent_id {
            return false;
        }
    } else if !task.to.required_capabilities.is_empty()
        && !task
            .to
            .required_capabilities
            .iter()
            .all(|required| capabilities.iter().any(|c| c == required))
    {
        return false;
    }

    if let (Some(workspace_id), Some(ws)) = (&task.to.workspace_id, workspace) {
        if &ws.repo_id != workspace_id {
            return false;
        }
    }

    true
}

/// Order tasks for dispatch: highest priority first, ties broken by age
/// (oldest first).
pub fn sort_for_dispatch(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
}
