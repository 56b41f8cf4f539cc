//! Error handling for the RPC surface
//!
//! Domain errors surface to callers inside the uniform `{content, isError}`
//! envelope; protocol-level failures (malformed request, unknown method)
//! become JSON-RPC error objects.

use dispatch_core::error::DispatchError;
use serde_json::{json, Value};
use thiserror::Error;

/// RPC-layer errors.
#[derive(Error, Debug)]
pub enum RpcError {
    /// An error produced by the queue or store; carried verbatim to the
    /// caller in the result envelope.
    #[error(transparent)]
    Domain(#[from] DispatchError),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RpcError {
    /// JSON-RPC error code for protocol-level failures.
    pub fn to_error_code(&self) -> i32 {
        match self {
            RpcError::Domain(_) => -32000,
            RpcError::InvalidParams(_) => -32602,
            RpcError::UnknownMethod(_) => -32601,
            RpcError::Serialization(_) => -32603,
        }
    }

    /// Build the full JSON-RPC response for this error.
    ///
    /// Domain errors return a successful JSON-RPC response whose result is
    /// an `isError` envelope; everything else is a JSON-RPC error object.
    pub fn to_json_rpc_response(&self, id: Option<Value>) -> Value {
        match self {
            RpcError::Domain(err) => json!({
                "jsonrpc": "2.0",
                "result": error_envelope(err),
                "id": id,
            }),
            other => json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": other.to_error_code(),
                    "message": other.to_string(),
                },
                "id": id,
            }),
        }
    }
}

/// Successful `{content, isError: false}` envelope.
pub fn content_envelope(content: Value) -> Value {
    json!({ "content": content, "isError": false })
}

/// Failed `{content, isError: true}` envelope carrying the error kind.
pub fn error_envelope(err: &DispatchError) -> Value {
    json!({
        "content": {
            "kind": err.kind().as_str(),
            "message": err.to_string(),
        },
        "isError": true,
    })
}
