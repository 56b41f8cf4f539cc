//! HTTP server for the dispatch RPC surface
//!
//! A JSON-RPC POST endpoint carrying the tool-call protocol, an SSE stream
//! fanning out queue events, and a liveness probe.

use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::{
    auth::AdminGate,
    error::{content_envelope, RpcError},
    handler::DispatchHandler,
};
use dispatch_core::{protocol::ProtocolHandler, repository::Store};
use dispatch_queue::{EventBus, TaskQueue};

/// Dispatch server over HTTP: JSON-RPC plus SSE event fan-out.
pub struct McpServer<S> {
    handler: Arc<DispatchHandler<S>>,
    bus: EventBus,
}

struct AppState<S> {
    handler: Arc<DispatchHandler<S>>,
    bus: EventBus,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl<S: Store + 'static> McpServer<S> {
    pub fn new(queue: Arc<TaskQueue<S>>, gate: AdminGate) -> Self {
        let bus = queue.bus().clone();
        Self {
            handler: Arc::new(DispatchHandler::new(queue, gate)),
            bus,
        }
    }

    /// Bind and serve until the process is stopped.
    pub async fn serve(self, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.into_router();
        info!(addr, "starting dispatch RPC server");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// The router, exposed separately so tests can bind an ephemeral port.
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/mcp/v1", get(sse_handler::<S>))
            .route("/mcp/v1/rpc", post(rpc_handler::<S>))
            .route("/health", get(health_handler))
            .with_state(AppState {
                handler: self.handler,
                bus: self.bus,
            })
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Serialization(e.to_string()))
}

/// Route one RPC method to the handler. Returns the raw content value;
/// the caller wraps it in the `{content, isError}` envelope.
async fn execute_method<S: Store>(
    handler: &DispatchHandler<S>,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        "register_agent" => {
            let result = handler.register_agent(parse_params(params)?).await?;
            to_value(&result)
        }
        "wait_for_prompt" => {
            let result = handler.wait_for_prompt(parse_params(params)?).await?;
            to_value(&result)
        }
        "ack_task" => {
            handler.ack_task(parse_params(params)?).await?;
            Ok(json!({"ok": true}))
        }
        "send_response" => {
            handler.send_response(parse_params(params)?).await?;
            Ok(json!({"ok": true}))
        }
        "update_progress" => {
            handler.update_progress(parse_params(params)?).await?;
            Ok(json!({"ok": true}))
        }
        "assign_task" => {
            let result = handler.assign_task(parse_params(params)?).await?;
            to_value(&result)
        }
        "wait_for_task" => {
            let result = handler.wait_for_task(parse_params(params)?).await?;
            to_value(&result)
        }
        "block_task" => {
            handler.block_task(parse_params(params)?).await?;
            Ok(json!({"ok": true}))
        }
        "answer_task" => {
            handler.answer_task(parse_params(params)?).await?;
            Ok(json!({"ok": true}))
        }
        "get_task_context" => {
            let result = handler.get_task_context(parse_params(params)?).await?;
            to_value(&result)
        }
        "list_agents" => {
            let params = if params.is_null() {
                Default::default()
            } else {
                parse_params(params)?
            };
            let result = handler.list_agents(params).await?;
            to_value(&result)
        }
        "get_stats" => {
            let result = handler.get_stats().await?;
            to_value(&result)
        }
        "submit_review" => {
            handler.submit_review(parse_params(params)?).await?;
            Ok(json!({"ok": true}))
        }
        "get_review_comments" => {
            let result = handler.get_review_comments(parse_params(params)?).await?;
            to_value(&result)
        }
        "resolve_review_comment" => {
            handler
                .resolve_review_comment(parse_params(params)?)
                .await?;
            Ok(json!({"ok": true}))
        }
        "admin_update_agent" => {
            let result = handler.admin_update_agent(parse_params(params)?).await?;
            to_value(&result)
        }
        "admin_evict_agent" => {
            handler.admin_evict_agent(parse_params(params)?).await?;
            Ok(json!({"ok": true}))
        }
        "admin_clear_tasks" => {
            let params = if params.is_null() {
                Default::default()
            } else {
                parse_params(params)?
            };
            handler.admin_clear_tasks(params).await?;
            Ok(json!({"ok": true}))
        }
        "broadcast_system_prompt" => {
            let result = handler
                .broadcast_system_prompt(parse_params(params)?)
                .await?;
            to_value(&result)
        }
        "health_check" => {
            let result = handler.health_check().await?;
            to_value(&result)
        }
        _ => Err(RpcError::UnknownMethod(method.to_string())),
    }
}

/// JSON-RPC endpoint.
async fn rpc_handler<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Json(request): Json<Value>,
) -> Json<Value> {
    let id = request.get("id").cloned();

    let method = match request.get("method").and_then(|v| v.as_str()) {
        Some(method) => method,
        None => {
            let error =
                RpcError::InvalidParams("missing 'method' field in JSON-RPC request".to_string());
            return Json(error.to_json_rpc_response(id));
        }
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    debug!(method, "rpc request");

    match execute_method(state.handler.as_ref(), method, params).await {
        Ok(content) => Json(json!({
            "jsonrpc": "2.0",
            "result": content_envelope(content),
            "id": id,
        })),
        Err(error) => Json(error.to_json_rpc_response(id)),
    }
}

/// SSE endpoint: welcome frame, periodic heartbeat, and the queue event
/// stream. A lagging client silently loses the oldest events.
async fn sse_handler<S: Store + 'static>(
    State(state): State<AppState<S>>,
) -> Sse<UnboundedReceiverStream<Result<Event, axum::Error>>> {
    let (tx, rx) = mpsc::unbounded_channel();

    let welcome = Event::default().event("welcome").data(
        json!({
            "server": "synapse-mcp",
            "version": env!("CARGO_PKG_VERSION"),
        })
        .to_string(),
    );
    let _ = tx.send(Ok(welcome));

    let heartbeat_tx = tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            let heartbeat = Event::default().event("heartbeat").data("ping");
            if heartbeat_tx.send(Ok(heartbeat)).is_err() {
                break;
            }
        }
    });

    let mut bus_rx = state.bus.subscribe();
    tokio::spawn(async move {
        loop {
            match bus_rx.recv().await {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    if tx.send(Ok(Event::default().event("queue").data(payload))).is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "sse subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx))
}

async fn health_handler() -> &'static str {
    "OK"
}
