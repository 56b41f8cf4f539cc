use crate::models::TaskStatus;
use thiserror::Error;

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error taxonomy for the dispatch server.
///
/// Internal components return these as values and never panic across
/// component boundaries. At the RPC layer every error maps to one of five
/// caller-visible kinds via [`DispatchError::kind`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Malformed input, illegal state transition, unknown target
    #[error("Validation error: {0}")]
    Validation(String),

    /// Task or agent id absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Admin-only surface called without (valid) credentials
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Long-poll or dependency wait exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Illegal transition attempted on the task state machine
    #[error("Invalid state transition from {0} to {1}")]
    InvalidTransition(TaskStatus, TaskStatus),

    /// Display name already held by a different agent id
    #[error("Display name already in use: {0}")]
    DuplicateDisplayName(String),

    /// Store operation failure
    #[error("Database error: {0}")]
    Database(String),

    /// Invariant violation or other unrecoverable failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Caller-visible error category carried in RPC envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Permission,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Permission => "PERMISSION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl DispatchError {
    pub fn not_found_task(id: &str) -> Self {
        Self::NotFound(format!("Task '{id}' not found"))
    }

    pub fn not_found_agent(id: &str) -> Self {
        Self::NotFound(format!("Agent '{id}' not found"))
    }

    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("Field '{field}' cannot be empty"))
    }

    pub fn invalid_transition(from: TaskStatus, to: TaskStatus) -> Self {
        Self::InvalidTransition(from, to)
    }

    /// Validation error with a machine-readable reason token, e.g.
    /// `wrong_agent` or `not_pending` on `ack_task`.
    pub fn validation_reason(reason: &str, detail: impl std::fmt::Display) -> Self {
        Self::Validation(format!("{reason}: {detail}"))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DispatchError::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout(_))
    }

    /// Collapse to the five-kind taxonomy surfaced to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Validation(_)
            | DispatchError::InvalidTransition(_, _)
            | DispatchError::DuplicateDisplayName(_) => ErrorKind::Validation,
            DispatchError::NotFound(_) => ErrorKind::NotFound,
            DispatchError::Permission(_) => ErrorKind::Permission,
            DispatchError::Timeout(_) => ErrorKind::Timeout,
            DispatchError::Database(_) | DispatchError::Internal(_) => ErrorKind::Internal,
        }
    }
}
