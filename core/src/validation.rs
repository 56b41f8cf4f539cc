use crate::{
    error::{DispatchError, Result},
    models::NewTask,
};
use std::time::Duration;

/// Long-poll clamp floor.
pub const MIN_POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Long-poll clamp ceiling.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(300);
/// Stock long-poll timeout; deployments may configure a different default.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(290);

/// Validation utilities for dispatch operations
pub struct DispatchValidator;

impl DispatchValidator {
    /// Validate a task about to be enqueued.
    pub fn validate_new_task(task: &NewTask) -> Result<()> {
        if task.prompt.trim().is_empty() {
            return Err(DispatchError::empty_field("prompt"));
        }
        for capability in &task.to.required_capabilities {
            Self::validate_capability(capability)?;
        }
        Ok(())
    }

    /// Validate an agent display name.
    ///
    /// Display names must be 1-64 characters, start and end alphanumeric,
    /// and contain only letters, numbers, spaces, hyphens, and underscores.
    pub fn validate_display_name(name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DispatchError::empty_field("displayName"));
        }
        if name.len() > 64 {
            return Err(DispatchError::Validation(
                "Display name must be at most 64 characters long".to_string(),
            ));
        }
        let first = name.chars().next().unwrap_or(' ');
        let last = name.chars().last().unwrap_or(' ');
        if !first.is_alphanumeric() || !last.is_alphanumeric() {
            return Err(DispatchError::Validation(
                "Display name must start and end with a letter or number".to_string(),
            ));
        }
        let valid = name
            .chars()
            .all(|c| c.is_alphanumeric() || c == ' ' || c == '-' || c == '_');
        if !valid {
            return Err(DispatchError::Validation(
                "Display name can only contain letters, numbers, spaces, hyphens, and underscores"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Validate a capability tag (kebab-case token).
    pub fn validate_capability(tag: &str) -> Result<()> {
        if tag.is_empty() {
            return Err(DispatchError::empty_field("capability"));
        }
        let valid = tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(DispatchError::Validation(format!(
                "Capability tag '{tag}' must be lowercase letters, digits, and hyphens"
            )));
        }
        Ok(())
    }

    /// Validate an agent id token.
    pub fn validate_agent_id(id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(DispatchError::empty_field("agentId"));
        }
        if id.len() > 128 {
            return Err(DispatchError::Validation(
                "Agent id must be at most 128 characters long".to_string(),
            ));
        }
        Ok(())
    }
}

/// Clamp a caller-supplied long-poll timeout (milliseconds) into the
/// allowed window; `None` yields the deployment's configured default,
/// itself clamped.
pub fn clamp_poll_timeout(timeout_ms: Option<u64>, default: Duration) -> Duration {
    timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default)
        .clamp(MIN_POLL_TIMEOUT, MAX_POLL_TIMEOUT)
}

/// Normalize a display-name alias for lookup: strip a leading `@`, trim,
/// and lowercase.
pub fn normalize_alias(name: &str) -> String {
    name.trim().trim_start_matches('@').to_lowercase()
}
