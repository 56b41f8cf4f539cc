//! Queue and scheduler scenario tests: the full lifecycle driven through
//! the public facade over an in-memory store.

use chrono::Utc;
use dispatch_core::models::{EvictionAction, Priority, TaskStatus};
use dispatch_core::repository::{AgentRepository, TaskRepository};
use dispatch_core::DispatchError;
use dispatch_queue::{
    Delivery, QueueConfig, ResponsePayload, Scheduler, SchedulerConfig, TaskQueue,
};
use mocks::{AgentBuilder, MockStore, TaskBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn setup() -> (MockStore, Arc<TaskQueue<MockStore>>, Scheduler<MockStore>) {
    let store = MockStore::new();
    let queue = Arc::new(TaskQueue::new(
        Arc::new(store.clone()),
        QueueConfig::default(),
    ));
    let scheduler = Scheduler::new(queue.clone(), SchedulerConfig::default());
    (store, queue, scheduler)
}

async fn register(store: &MockStore, builder: AgentBuilder) {
    store.register(builder.build()).await.unwrap();
}

fn park(
    queue: &Arc<TaskQueue<MockStore>>,
    agent_id: &str,
    timeout: Duration,
) -> JoinHandle<Option<Delivery>> {
    let queue = queue.clone();
    let agent_id = agent_id.to_string();
    tokio::spawn(async move { queue.wait_for_task(&agent_id, timeout).await.unwrap() })
}

async fn until_waiting(queue: &Arc<TaskQueue<MockStore>>, agent_id: &str) {
    for _ in 0..100 {
        if queue.is_agent_waiting(agent_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("agent {agent_id} never entered the waiting registry");
}

fn delivered_task(delivery: Option<Delivery>) -> dispatch_core::models::Task {
    match delivery {
        Some(Delivery::Task(task)) => task,
        other => panic!("expected a task delivery, got {other:?}"),
    }
}

// S1: register -> park -> enqueue -> deliver -> ack -> progress -> complete,
// and the recorded status trajectory is exactly the canonical path.
#[tokio::test]
async fn happy_path_round_trip() {
    let (store, queue, _) = setup();
    register(
        &store,
        AgentBuilder::new("agent-a")
            .display_name("Frodo")
            .capabilities(&["code-writing"])
            .github_workspace("org/repo"),
    )
    .await;

    let waiter = park(&queue, "agent-a", Duration::from_secs(10));
    until_waiting(&queue, "agent-a").await;

    let enqueued = queue
        .enqueue(
            TaskBuilder::new("add login")
                .require_capabilities(&["code-writing"])
                .workspace("org/repo")
                .build_new(),
        )
        .await
        .unwrap();
    assert_eq!(enqueued.status, TaskStatus::PendingAck);

    let delivered = delivered_task(waiter.await.unwrap());
    assert_eq!(delivered.id, enqueued.id);
    assert_eq!(delivered.prompt, "add login");
    assert!(delivered.context.get("dependencyOutputs").is_some());

    let acked = queue.ack_task(&delivered.id, "agent-a").await.unwrap();
    assert_eq!(acked.status, TaskStatus::Assigned);
    assert_eq!(acked.assigned_to.as_deref(), Some("agent-a"));

    let in_progress = queue
        .update_progress(&delivered.id, "agent-a", "wiring", Some(50.0), None)
        .await
        .unwrap();
    assert_eq!(in_progress.status, TaskStatus::InProgress);

    let completed = queue
        .send_response(
            &delivered.id,
            TaskStatus::Completed,
            ResponsePayload {
                message: "done".to_string(),
                artifacts: vec!["src/login.ts".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);
    assert!(completed.completed_at.is_some());
    assert_eq!(completed.response.as_ref().unwrap().message, "done");

    let history = queue.status_history(&delivered.id).await.unwrap();
    assert_eq!(
        history,
        vec![
            TaskStatus::Queued,
            TaskStatus::PendingAck,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::Completed,
        ]
    );

    // Invariant: terminal implies no pending-ack entry
    assert!(queue.pending_acks().await.is_empty());
}

// S2: a delivered-but-never-acked task is reclaimed after the ACK timeout
// and handed to the next eligible waiter.
#[tokio::test]
async fn stuck_ack_recovery() {
    let (store, queue, scheduler) = setup();
    register(&store, AgentBuilder::new("agent-b").display_name("B")).await;
    register(&store, AgentBuilder::new("agent-c").display_name("C")).await;

    queue
        .enqueue(TaskBuilder::new("orphan delivery").build_new())
        .await
        .unwrap();

    // B takes the task synchronously but never acknowledges
    let delivery = queue
        .wait_for_task("agent-b", Duration::from_millis(50))
        .await
        .unwrap();
    let task = delivered_task(delivery);
    assert_eq!(task.status, TaskStatus::PendingAck);
    assert!(queue.pending_acks().await.contains_key(&task.id));

    // 61 seconds later the scheduler reclaims it
    scheduler.tick_at(Utc::now() + chrono::Duration::seconds(61)).await;

    let reloaded = queue.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Queued);
    assert!(!queue.pending_acks().await.contains_key(&task.id));

    // B's stale acknowledgement now fails
    let err = queue.ack_task(&task.id, "agent-b").await.unwrap_err();
    assert!(matches!(&err, DispatchError::Validation(msg) if msg.starts_with("not_pending")));

    // C receives it on the next poll
    let redelivered = queue
        .wait_for_task("agent-c", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(delivered_task(redelivered).id, task.id);
}

// S3: a critical task preempts older normal tasks for the only waiter.
// The tasks land in the store while the agent is already parked (no
// enqueue-time match), so the scheduler tick performs the assignment.
#[tokio::test]
async fn priority_preemption_during_tick() {
    let (store, queue, scheduler) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let waiter = park(&queue, "agent-a", Duration::from_secs(10));
    until_waiting(&queue, "agent-a").await;

    let now = Utc::now();
    let n1 = TaskBuilder::new("normal older")
        .created_at(now - chrono::Duration::seconds(30))
        .build();
    let c1 = TaskBuilder::new("critical newer")
        .priority(Priority::Critical)
        .created_at(now)
        .build();
    let n2 = TaskBuilder::new("normal newest").created_at(now).build();
    for task in [&n1, &c1, &n2] {
        store.insert(task).await.unwrap();
    }

    scheduler.tick().await;

    let delivered = delivered_task(waiter.await.unwrap());
    assert_eq!(delivered.id, c1.id);

    for remaining in [&n1, &n2] {
        let task = queue.get_task(&remaining.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued, "task {} moved", task.id);
    }
}

// A waiter that parked first gets priority-ordered work synchronously.
#[tokio::test]
async fn synchronous_path_prefers_high_priority() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    queue
        .enqueue(TaskBuilder::new("normal").build_new())
        .await
        .unwrap();
    let critical = queue
        .enqueue(
            TaskBuilder::new("critical")
                .priority(Priority::Critical)
                .build_new(),
        )
        .await
        .unwrap();

    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(delivered_task(delivery).id, critical.id);
}

// S4: a dependency-blocked task unblocks within one tick of its dependency
// completing and reaches a waiting agent in the same tick.
#[tokio::test]
async fn dependency_unblocking() {
    let (store, queue, scheduler) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let t3 = queue
        .enqueue(TaskBuilder::new("prerequisite").build_new())
        .await
        .unwrap();

    let t4 = queue
        .enqueue(
            TaskBuilder::new("dependent")
                .depends_on(&[&t3.id])
                .build_new(),
        )
        .await
        .unwrap();
    assert_eq!(t4.status, TaskStatus::Blocked);

    // Drive T3 through its lifecycle on agent-a
    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(delivered_task(delivery).id, t3.id);
    queue.ack_task(&t3.id, "agent-a").await.unwrap();
    queue
        .send_response(
            &t3.id,
            TaskStatus::Completed,
            ResponsePayload {
                message: "prereq done".to_string(),
                artifacts: vec!["out.txt".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let waiter = park(&queue, "agent-a", Duration::from_secs(10));
    until_waiting(&queue, "agent-a").await;

    scheduler.tick().await;

    let delivered = delivered_task(waiter.await.unwrap());
    assert_eq!(delivered.id, t4.id);
    // Dependency outputs are injected when the task is served
    let outputs = delivered.context.get("dependencyOutputs").unwrap();
    assert_eq!(outputs[&t3.id]["message"], "prereq done");
    assert_eq!(outputs[&t3.id]["artifacts"][0], "out.txt");
}

// A blocked-for-clarification task (no dependencies) is never auto-unblocked;
// answer_task is the only way out.
#[tokio::test]
async fn clarification_block_requires_answer() {
    let (store, queue, scheduler) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let task = queue
        .enqueue(TaskBuilder::new("ambiguous work").build_new())
        .await
        .unwrap();
    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    drop(delivery);
    queue.ack_task(&task.id, "agent-a").await.unwrap();
    queue
        .block_task(
            &task.id,
            dispatch_core::protocol::BlockReason::Clarification,
            "which OAuth provider?",
            "need provider choice",
            None,
            vec![],
        )
        .await
        .unwrap();

    scheduler.tick().await;
    assert_eq!(
        queue.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Blocked
    );

    let answered = queue.answer_task(&task.id, "use GitHub OAuth").await.unwrap();
    assert_eq!(answered.status, TaskStatus::Queued);

    let messages = queue.get_messages(&task.id).await.unwrap();
    assert!(messages.iter().any(|m| m.message_type == "block_event"));
    assert!(messages.iter().any(|m| m.message_type == "answer"));
}

// S5: an agent that stops heartbeating loses its assignment.
#[tokio::test]
async fn orphan_reclamation() {
    let (store, queue, scheduler) = setup();
    register(&store, AgentBuilder::new("agent-d").display_name("D")).await;
    register(&store, AgentBuilder::new("agent-e").display_name("E")).await;

    let task = queue
        .enqueue(TaskBuilder::new("orphaned work").build_new())
        .await
        .unwrap();
    let delivery = queue
        .wait_for_task("agent-d", Duration::from_millis(50))
        .await
        .unwrap();
    drop(delivery);
    queue.ack_task(&task.id, "agent-d").await.unwrap();

    // D goes dark for six minutes
    store.set_last_seen("agent-d", Utc::now() - chrono::Duration::minutes(6));
    scheduler.tick().await;

    let reloaded = queue.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Queued);
    assert!(reloaded.assigned_to.is_none());

    // E may now pick it up
    let redelivered = queue
        .wait_for_task("agent-e", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(delivered_task(redelivered).id, task.id);
}

// S6: workspace mismatch filters a capable agent; a matching workspace
// receives the task.
#[tokio::test]
async fn workspace_mismatch() {
    let (store, queue, _) = setup();
    register(
        &store,
        AgentBuilder::new("agent-f")
            .display_name("F")
            .capabilities(&["code-writing"])
            .github_workspace("org/a"),
    )
    .await;

    let task = queue
        .enqueue(
            TaskBuilder::new("workspace-pinned")
                .require_capabilities(&["code-writing"])
                .workspace("org/b")
                .build_new(),
        )
        .await
        .unwrap();

    let missed = queue
        .wait_for_task("agent-f", Duration::from_millis(100))
        .await
        .unwrap();
    assert!(missed.is_none(), "agent-f must not receive the task");

    register(
        &store,
        AgentBuilder::new("agent-g")
            .display_name("G")
            .capabilities(&["code-writing"])
            .github_workspace("org/b"),
    )
    .await;
    let delivered = queue
        .wait_for_task("agent-g", Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(delivered_task(delivered).id, task.id);
}

// Property 4: N eligible tasks and N pre-parked agents produce exactly N
// distinct assignments.
#[tokio::test]
async fn fanout_delivers_exactly_once() {
    let (store, queue, _) = setup();
    const N: usize = 5;

    let mut waiters = Vec::new();
    for i in 0..N {
        let agent_id = format!("agent-{i}");
        register(&store, AgentBuilder::new(&agent_id).display_name(&agent_id)).await;
        waiters.push(park(&queue, &agent_id, Duration::from_secs(10)));
        until_waiting(&queue, &agent_id).await;
    }

    for i in 0..N {
        queue
            .enqueue(TaskBuilder::new(format!("task {i}")).build_new())
            .await
            .unwrap();
    }

    let mut delivered_ids = Vec::new();
    for waiter in waiters {
        let task = delivered_task(waiter.await.unwrap());
        delivered_ids.push(task.id);
    }
    delivered_ids.sort();
    delivered_ids.dedup();
    assert_eq!(delivered_ids.len(), N, "every delivery must be distinct");
    assert_eq!(queue.pending_acks().await.len(), N);
}

// Property 5: two waiters racing one enqueue; exactly one receives it.
#[tokio::test]
async fn racing_waiters_single_delivery() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-x").display_name("X")).await;
    register(&store, AgentBuilder::new("agent-y").display_name("Y")).await;

    let wx = park(&queue, "agent-x", Duration::from_millis(400));
    let wy = park(&queue, "agent-y", Duration::from_millis(400));
    until_waiting(&queue, "agent-x").await;
    until_waiting(&queue, "agent-y").await;

    queue
        .enqueue(TaskBuilder::new("contested").build_new())
        .await
        .unwrap();

    let results = vec![wx.await.unwrap(), wy.await.unwrap()];
    let received: Vec<_> = results
        .into_iter()
        .filter(|r| matches!(r, Some(Delivery::Task(_))))
        .collect();
    assert_eq!(received.len(), 1, "exactly one waiter receives the task");
}

// Property 6: after forceRetry of a PENDING_ACK task the original agent's
// ack fails with not_pending.
#[tokio::test]
async fn force_retry_invalidates_pending_ack() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let task = queue
        .enqueue(TaskBuilder::new("retry me").build_new())
        .await
        .unwrap();
    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    drop(delivery);

    queue.force_retry(&task.id).await.unwrap();

    let err = queue.ack_task(&task.id, "agent-a").await.unwrap_err();
    assert!(matches!(&err, DispatchError::Validation(msg) if msg.starts_with("not_pending")));

    let reloaded = queue.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Queued);
    assert!(reloaded.assigned_to.is_none());
}

#[tokio::test]
async fn ack_by_wrong_agent_rejected() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;
    register(&store, AgentBuilder::new("agent-b").display_name("B")).await;

    let task = queue
        .enqueue(TaskBuilder::new("for a").build_new())
        .await
        .unwrap();
    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    drop(delivery);

    let err = queue.ack_task(&task.id, "agent-b").await.unwrap_err();
    assert!(matches!(&err, DispatchError::Validation(msg) if msg.starts_with("wrong_agent")));

    // The rightful agent still succeeds
    queue.ack_task(&task.id, "agent-a").await.unwrap();
}

// Property 8: a task 31 minutes idle is requeued; 29 minutes is not.
#[tokio::test]
async fn stale_threshold_boundary() {
    let (store, queue, scheduler) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;
    register(&store, AgentBuilder::new("agent-b").display_name("B")).await;

    let fresh = queue
        .enqueue(TaskBuilder::new("fresh").target_agent("agent-a").build_new())
        .await
        .unwrap();
    let stale = queue
        .enqueue(TaskBuilder::new("stale").target_agent("agent-b").build_new())
        .await
        .unwrap();

    for (task, agent) in [(&fresh, "agent-a"), (&stale, "agent-b")] {
        let delivery = queue
            .wait_for_task(agent, Duration::from_millis(50))
            .await
            .unwrap();
        drop(delivery);
        queue.ack_task(&task.id, agent).await.unwrap();
        queue
            .update_progress(&task.id, agent, "working", Some(10.0), None)
            .await
            .unwrap();
    }

    store.set_created_at(&fresh.id, Utc::now() - chrono::Duration::minutes(29));
    store.set_created_at(&stale.id, Utc::now() - chrono::Duration::minutes(31));
    // Progress messages carry now-timestamps; age them with their tasks
    let messages_fresh = queue.get_messages(&fresh.id).await.unwrap();
    let messages_stale = queue.get_messages(&stale.id).await.unwrap();
    for m in messages_fresh.iter().filter(|m| m.metadata.get("percentage").is_some()) {
        store.set_message_timestamp(m.id, Utc::now() - chrono::Duration::minutes(29));
    }
    for m in messages_stale.iter().filter(|m| m.metadata.get("percentage").is_some()) {
        store.set_message_timestamp(m.id, Utc::now() - chrono::Duration::minutes(31));
    }

    scheduler.tick().await;

    assert_eq!(
        queue.get_task(&fresh.id).await.unwrap().unwrap().status,
        TaskStatus::InProgress,
        "29-minute-old activity must not be reclaimed"
    );
    assert_eq!(
        queue.get_task(&stale.id).await.unwrap().unwrap().status,
        TaskStatus::Queued,
        "31-minute-old activity must be reclaimed"
    );
}

// Two back-to-back ticks with no external events leave identical state.
#[tokio::test]
async fn scheduler_tick_is_idempotent() {
    let (store, queue, scheduler) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    queue
        .enqueue(TaskBuilder::new("one").build_new())
        .await
        .unwrap();
    queue
        .enqueue(TaskBuilder::new("two").depends_on(&["task-phantom-dep"]).build_new())
        .await
        .unwrap();

    scheduler.tick().await;
    let stats_after_first = queue.get_stats().await.unwrap();
    let acks_after_first = queue.pending_acks().await.len();

    scheduler.tick().await;
    let stats_after_second = queue.get_stats().await.unwrap();
    let acks_after_second = queue.pending_acks().await.len();

    assert_eq!(stats_after_first, stats_after_second);
    assert_eq!(acks_after_first, acks_after_second);
}

// Unknown dependency ids are treated as satisfied (no deadlock on phantoms).
#[tokio::test]
async fn phantom_dependencies_do_not_block() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let task = queue
        .enqueue(
            TaskBuilder::new("phantom dep")
                .depends_on(&["task-never-existed"])
                .build_new(),
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(delivered_task(delivery).id, task.id);
}

#[tokio::test]
async fn cancel_is_idempotent_and_clears_pending_ack() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let task = queue
        .enqueue(TaskBuilder::new("cancel me").build_new())
        .await
        .unwrap();
    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    drop(delivery);
    assert!(queue.pending_acks().await.contains_key(&task.id));

    let cancelled = queue.cancel_task(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(queue.pending_acks().await.is_empty());

    // Idempotent
    let again = queue.cancel_task(&task.id).await.unwrap();
    assert_eq!(again.status, TaskStatus::Cancelled);

    // But a completed task cannot be cancelled
    let done = queue
        .enqueue(TaskBuilder::new("done").build_new())
        .await
        .unwrap();
    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    drop(delivery);
    queue.ack_task(&done.id, "agent-a").await.unwrap();
    queue
        .send_response(&done.id, TaskStatus::Completed, ResponsePayload::default())
        .await
        .unwrap();
    assert!(queue.cancel_task(&done.id).await.is_err());
}

#[tokio::test]
async fn wait_for_completion_observes_terminal_transition() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let task = queue
        .enqueue(TaskBuilder::new("watched").build_new())
        .await
        .unwrap();

    let watcher = {
        let queue = queue.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            queue
                .wait_for_completion(&task_id, Duration::from_secs(5))
                .await
                .unwrap()
        })
    };

    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    drop(delivery);
    queue.ack_task(&task.id, "agent-a").await.unwrap();
    queue
        .send_response(
            &task.id,
            TaskStatus::Failed,
            ResponsePayload {
                message: "could not reproduce".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let observed = watcher.await.unwrap().expect("watcher must see the terminal state");
    assert_eq!(observed.status, TaskStatus::Failed);

    // Timeout path
    let pending = queue
        .enqueue(TaskBuilder::new("never finishes").build_new())
        .await
        .unwrap();
    let observed = queue
        .wait_for_completion(&pending.id, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(observed.is_none());
}

#[tokio::test]
async fn eviction_signal_interrupts_parked_agent() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let waiter = park(&queue, "agent-a", Duration::from_secs(10));
    until_waiting(&queue, "agent-a").await;

    queue
        .evict_agent("agent-a", "rolling restart", EvictionAction::Restart)
        .await
        .unwrap();

    match waiter.await.unwrap() {
        Some(Delivery::Control(dispatch_core::models::ControlSignal::Evict {
            reason,
            action,
        })) => {
            assert_eq!(reason, "rolling restart");
            assert_eq!(action, EvictionAction::Restart);
        }
        other => panic!("expected eviction signal, got {other:?}"),
    }
}

#[tokio::test]
async fn eviction_signal_served_on_next_poll_when_not_parked() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    queue
        .evict_agent("agent-a", "shutdown", EvictionAction::Kill)
        .await
        .unwrap();

    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(matches!(
        delivery,
        Some(Delivery::Control(
            dispatch_core::models::ControlSignal::Evict { .. }
        ))
    ));
}

#[tokio::test]
async fn broadcast_system_prompt_reaches_parked_and_absent_agents() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;
    register(&store, AgentBuilder::new("agent-b").display_name("B")).await;

    let waiter = park(&queue, "agent-a", Duration::from_secs(10));
    until_waiting(&queue, "agent-a").await;

    let (delivered, stored) = queue.broadcast_system_prompt("fleet notice").await.unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(stored, 1);

    match waiter.await.unwrap() {
        Some(Delivery::Control(dispatch_core::models::ControlSignal::SystemPrompt { prompt })) => {
            assert_eq!(prompt, "fleet notice")
        }
        other => panic!("expected system prompt, got {other:?}"),
    }

    // The absent agent receives the stored prompt on its next poll
    let delivery = queue
        .wait_for_task("agent-b", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(matches!(
        delivery,
        Some(Delivery::Control(
            dispatch_core::models::ControlSignal::SystemPrompt { .. }
        ))
    ));
}

// Queued work outranks a pending eviction on the same poll.
#[tokio::test]
async fn queued_work_served_before_eviction() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let task = queue
        .enqueue(TaskBuilder::new("work first").build_new())
        .await
        .unwrap();
    queue
        .evict_agent("agent-a", "later", EvictionAction::Restart)
        .await
        .unwrap();

    let first = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(delivered_task(first).id, task.id);

    let second = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(matches!(
        second,
        Some(Delivery::Control(
            dispatch_core::models::ControlSignal::Evict { .. }
        ))
    ));
}

#[tokio::test]
async fn enqueue_with_unknown_target_agent_fails() {
    let (_store, queue, _) = setup();
    let err = queue
        .enqueue(
            TaskBuilder::new("misrouted")
                .target_agent("agent-ghost")
                .build_new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(&err, DispatchError::Validation(msg) if msg.starts_with("unknown_agent")));
}

#[tokio::test]
async fn waiting_registry_snapshot_and_timeout_cleanup() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let waiter = park(&queue, "agent-a", Duration::from_millis(80));
    until_waiting(&queue, "agent-a").await;

    let waiting = queue.waiting_agents().await;
    assert!(waiting.contains_key("agent-a"));

    // Poll times out with nothing enqueued; the entry must not leak
    assert!(waiter.await.unwrap().is_none());
    assert!(!queue.is_agent_waiting("agent-a").await);
    assert!(queue.waiting_agents().await.is_empty());
}

#[tokio::test]
async fn review_cycle_transitions() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let task = queue
        .enqueue(TaskBuilder::new("review flow").build_new())
        .await
        .unwrap();
    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    drop(delivery);
    queue.ack_task(&task.id, "agent-a").await.unwrap();
    queue
        .update_progress(&task.id, "agent-a", "implementing", Some(80.0), None)
        .await
        .unwrap();

    let in_review = queue
        .send_response(
            &task.id,
            TaskStatus::InReview,
            ResponsePayload {
                message: "ready for review".to_string(),
                diff: Some("--- a/x\n+++ b/x".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(in_review.status, TaskStatus::InReview);

    // Completing straight from review is illegal; approval comes first
    assert!(queue
        .send_response(&task.id, TaskStatus::Completed, ResponsePayload::default())
        .await
        .is_err());

    let approved = queue
        .send_response(&task.id, TaskStatus::Approved, ResponsePayload::default())
        .await
        .unwrap();
    assert_eq!(approved.status, TaskStatus::Approved);

    let completed = queue
        .send_response(
            &task.id,
            TaskStatus::Completed,
            ResponsePayload {
                message: "shipped".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);
}

#[tokio::test]
async fn blocked_response_requires_reason() {
    let (store, queue, _) = setup();
    register(&store, AgentBuilder::new("agent-a").display_name("A")).await;

    let task = queue
        .enqueue(TaskBuilder::new("will block").build_new())
        .await
        .unwrap();
    let delivery = queue
        .wait_for_task("agent-a", Duration::from_millis(50))
        .await
        .unwrap();
    drop(delivery);
    queue.ack_task(&task.id, "agent-a").await.unwrap();

    let err = queue
        .send_response(&task.id, TaskStatus::Blocked, ResponsePayload::default())
        .await
        .unwrap_err();
    assert!(err.is_validation());

    queue
        .send_response(
            &task.id,
            TaskStatus::Blocked,
            ResponsePayload {
                blocked_reason: Some("waiting on credentials".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        queue.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Blocked
    );
}
