//! Dispatch RPC surface
//!
//! JSON-framed tool-call protocol over HTTP for the dispatch server:
//! the [`handler::DispatchHandler`] implements the protocol-handler trait
//! over the task queue, [`server::McpServer`] exposes it as JSON-RPC plus
//! an SSE event stream, and [`auth::AdminGate`] guards the admin surface.

pub mod auth;
pub mod error;
pub mod handler;
pub mod server;

pub use auth::AdminGate;
pub use error::RpcError;
pub use handler::DispatchHandler;
pub use server::McpServer;
