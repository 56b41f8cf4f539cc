//! Dispatch Core Library
//!
//! Foundational domain models, the task state machine, error taxonomy, and
//! trait interfaces for the multi-agent task dispatch server. All other
//! crates depend on the types and interfaces defined here.
//!
//! # Architecture
//!
//! - [`models`] - Core domain models (Task, TaskStatus, Agent, etc.)
//! - [`error`] - Error types and result handling
//! - [`repository`] - Repository traits for the durable store
//! - [`protocol`] - Protocol handler trait and RPC parameter types
//! - [`validation`] - Request-level validation utilities

pub mod error;
pub mod models;
pub mod protocol;
pub mod repository;
pub mod validation;

// Re-export commonly used types at the crate root for convenience
pub use error::{DispatchError, ErrorKind, Result};
pub use models::{
    Agent, AgentActivity, AgentSource, AgentSummary, ControlSignal, EvictionAction,
    EvictionRequest, HistoryFilter, MessageRole, NewAgent, NewReviewComment, NewTask, OriginKind,
    Priority, ReviewComment, RoutingHints, Task, TaskMessage, TaskOrigin, TaskResponse, TaskStatus,
    WorkspaceContext, WorkspaceKind,
};
pub use protocol::{HealthStatus, ProtocolHandler};
pub use repository::{
    AgentRepository, QueueStats, ReviewCommentRepository, Store, TaskMessageRepository,
    TaskRepository,
};
pub use validation::DispatchValidator;

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
