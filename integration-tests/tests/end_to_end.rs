//! End-to-end tests: the real store, queue, scheduler, and HTTP server,
//! driven over JSON-RPC the way producers and agents drive it.

use dispatch_queue::Scheduler;
use mcp_server::config::Config;
use mcp_server::setup::{create_queue, create_server, create_store};
use serde_json::{json, Value};
use tempfile::TempDir;

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    _workdir: TempDir,
    server_handle: tokio::task::JoinHandle<()>,
    scheduler_handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let workdir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.database.url = Some(format!(
            "sqlite://{}",
            workdir.path().join("e2e.sqlite").display()
        ));
        // Fast cadence so maintenance is visible within a test
        config.queue.tick_interval_secs = 1;

        let store = create_store(&config).await.unwrap();
        let queue = create_queue(store, &config);
        let scheduler_handle =
            Scheduler::new(queue.clone(), config.scheduler_config()).spawn();
        let server = create_server(queue, &config);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = server.into_router();
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            _workdir: workdir,
            server_handle,
            scheduler_handle,
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Value {
        self.client
            .post(format!("{}/mcp/v1/rpc", self.base_url))
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1,
            }))
            .send()
            .await
            .unwrap()
            .json::<Value>()
            .await
            .unwrap()
    }

    /// Call and unwrap a successful `{content, isError: false}` envelope.
    async fn call(&self, method: &str, params: Value) -> Value {
        let response = self.rpc(method, params).await;
        let result = &response["result"];
        assert_eq!(
            result["isError"], false,
            "{method} failed: {result}"
        );
        result["content"].clone()
    }

    fn stop(self) {
        self.server_handle.abort();
        self.scheduler_handle.abort();
    }
}

#[tokio::test]
async fn health_endpoint_responds() {
    let server = TestServer::start().await;

    let body = server
        .client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");

    let health = server.call("health_check", Value::Null).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["database"], true);

    server.stop();
}

#[tokio::test]
async fn full_lifecycle_over_http() {
    let server = TestServer::start().await;

    let registered = server
        .call(
            "register_agent",
            json!({
                "id": "agent-e2e",
                "displayName": "EndToEnd",
                "capabilities": ["code-writing"],
                "workspaceContext": {"type": "github", "repoId": "org/repo"},
            }),
        )
        .await;
    assert_eq!(registered["id"], "agent-e2e");

    let assigned = server
        .call(
            "assign_task",
            json!({
                "prompt": "add login\nwith OAuth support",
                "workspaceId": "org/repo",
                "requiredCapabilities": ["code-writing"],
                "priority": "normal",
            }),
        )
        .await;
    let task_id = assigned["taskId"].as_str().unwrap().to_string();

    let delivery = server
        .call(
            "wait_for_prompt",
            json!({"agentId": "agent-e2e", "timeout": 2000}),
        )
        .await;
    assert_eq!(delivery["taskId"], task_id);
    assert_eq!(delivery["prompt"], "add login\nwith OAuth support");

    server
        .call("ack_task", json!({"taskId": task_id, "agentId": "agent-e2e"}))
        .await;

    server
        .call(
            "update_progress",
            json!({
                "taskId": task_id,
                "agentId": "agent-e2e",
                "message": "wiring the provider",
                "percentage": 50,
            }),
        )
        .await;

    server
        .call(
            "send_response",
            json!({
                "taskId": task_id,
                "status": "COMPLETED",
                "message": "done",
                "artifacts": ["src/login.ts"],
            }),
        )
        .await;

    // The dependency-wait surface sees the terminal state immediately
    let outcome = server
        .call("wait_for_task", json!({"taskId": task_id, "timeout": 2000}))
        .await;
    assert_eq!(outcome["status"], "COMPLETED");
    assert_eq!(outcome["response"]["artifacts"][0], "src/login.ts");

    // Round-trip history: QUEUED → PENDING_ACK → ASSIGNED → IN_PROGRESS → COMPLETED
    let context = server
        .call("get_task_context", json!({"taskId": task_id}))
        .await;
    assert_eq!(context["status"], "COMPLETED");
    let transitions: Vec<String> = context["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["messageType"] == "status_change")
        .filter_map(|m| m["metadata"]["to"].as_str().map(String::from))
        .collect();
    assert_eq!(
        transitions,
        vec!["QUEUED", "PENDING_ACK", "ASSIGNED", "IN_PROGRESS", "COMPLETED"]
    );

    let stats = server.call("get_stats", Value::Null).await;
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["completed"], 1);

    server.stop();
}

#[tokio::test]
async fn long_poll_timeout_sentinel() {
    let server = TestServer::start().await;

    server
        .call(
            "register_agent",
            json!({"id": "agent-idle", "displayName": "Idle", "capabilities": []}),
        )
        .await;

    let outcome = server
        .call(
            "wait_for_prompt",
            json!({"agentId": "agent-idle", "timeout": 1000}),
        )
        .await;
    assert_eq!(outcome, json!({"status": "TIMEOUT"}));

    server.stop();
}

#[tokio::test]
async fn domain_errors_carry_the_envelope() {
    let server = TestServer::start().await;

    // Unknown task id
    let response = server
        .rpc("get_task_context", json!({"taskId": "task-ghost"}))
        .await;
    assert_eq!(response["result"]["isError"], true);
    assert_eq!(response["result"]["content"]["kind"], "NOT_FOUND");

    // Ack without a pending delivery
    server
        .call(
            "register_agent",
            json!({"id": "agent-x", "displayName": "X", "capabilities": []}),
        )
        .await;
    let assigned = server
        .call(
            "assign_task",
            json!({"prompt": "never delivered", "workspaceId": "org/repo"}),
        )
        .await;
    let response = server
        .rpc(
            "ack_task",
            json!({"taskId": assigned["taskId"], "agentId": "agent-x"}),
        )
        .await;
    assert_eq!(response["result"]["isError"], true);
    assert_eq!(response["result"]["content"]["kind"], "VALIDATION");

    // Unknown method is a JSON-RPC protocol error, not an envelope
    let response = server.rpc("no_such_method", Value::Null).await;
    assert_eq!(response["error"]["code"], -32601);

    server.stop();
}

#[tokio::test]
async fn list_agents_reflects_activity() {
    let server = TestServer::start().await;

    server
        .call(
            "register_agent",
            json!({"id": "agent-l", "displayName": "Lister", "capabilities": ["review"]}),
        )
        .await;

    let agents = server.call("list_agents", json!({})).await;
    let agents = agents.as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["id"], "agent-l");
    // Registered but neither parked nor working
    assert_eq!(agents[0]["status"], "OFFLINE");

    let filtered = server
        .call("list_agents", json!({"capability": "code-writing"}))
        .await;
    assert!(filtered.as_array().unwrap().is_empty());

    server.stop();
}
