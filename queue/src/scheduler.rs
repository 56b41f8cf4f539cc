//! Hybrid scheduler
//!
//! Periodic maintenance cycle healing every category of stuck state. One
//! tick runs six focused sweeps in order; each sweep is isolated so a
//! failure in one never aborts the others, and the cycle is idempotent:
//! two back-to-back ticks with no external events produce identical state.

use crate::bus::QueueEvent;
use crate::queue::TaskQueue;
use chrono::{DateTime, Utc};
use dispatch_core::repository::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Scheduler tuning. Thresholds for the individual sweeps live in
/// [`crate::queue::QueueConfig`]; this carries the cadence and the
/// agent-cleanup horizon.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Agents unseen this long (with no work and not parked) are deleted
    pub stale_agent_threshold: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            stale_agent_threshold: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub struct Scheduler<S> {
    queue: Arc<TaskQueue<S>>,
    config: SchedulerConfig,
}

impl<S: Store + 'static> Scheduler<S> {
    pub fn new(queue: Arc<TaskQueue<S>>, config: SchedulerConfig) -> Self {
        Self { queue, config }
    }

    /// One maintenance cycle at the current wall-clock time.
    pub async fn tick(&self) {
        self.tick_at(Utc::now()).await;
    }

    /// One maintenance cycle with an explicit `now`, so tests can step time
    /// deterministically.
    pub async fn tick_at(&self, now: DateTime<Utc>) {
        match self.queue.requeue_stuck_acks(now).await {
            Ok(n) if n > 0 => debug!(requeued = n, "stuck PENDING_ACK sweep"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stuck PENDING_ACK sweep failed"),
        }

        match self.queue.unblock_ready().await {
            Ok(n) if n > 0 => debug!(unblocked = n, "dependency sweep"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "dependency sweep failed"),
        }

        match self.queue.assign_pending().await {
            Ok(n) if n > 0 => debug!(assigned = n, "assignment sweep"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "assignment sweep failed"),
        }

        match self.queue.reclaim_stale(now).await {
            Ok(n) if n > 0 => debug!(reclaimed = n, "stale-task sweep"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale-task sweep failed"),
        }

        match self.queue.reclaim_orphans(now).await {
            Ok(n) if n > 0 => debug!(reclaimed = n, "orphan sweep"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "orphan sweep failed"),
        }

        match self
            .queue
            .cleanup_stale_agents(now, self.config.stale_agent_threshold)
            .await
        {
            Ok(n) if n > 0 => debug!(removed = n, "stale-agent sweep"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale-agent sweep failed"),
        }

        match self.queue.agent_snapshot().await {
            Ok(agents) => self.queue.bus().publish(QueueEvent::AgentList { agents }),
            Err(e) => warn!(error = %e, "agent snapshot failed"),
        }
    }

    /// Run the cycle forever on the configured interval. Ticks are
    /// serialized; a slow tick delays the next rather than overlapping it.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}
