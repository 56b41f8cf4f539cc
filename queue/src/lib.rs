//! Dispatch Queue
//!
//! The core of the dispatch server: the task queue facade, the
//! waiting-agent registry and long-poll rendezvous, the matching algorithm,
//! the hybrid scheduler, and the in-process event bus.
//!
//! # Architecture
//!
//! - [`queue`] - Public facade; every task mutation goes through it
//! - [`registry`] - In-memory map of parked long-polls with one-shot
//!   delivery channels
//! - [`matching`] - Eligibility predicate and dispatch ordering
//! - [`scheduler`] - Periodic healing cycle (requeue, unblock, assign,
//!   reclaim)
//! - [`bus`] - Publish/subscribe feeding external SSE/WebSocket fan-out

pub mod bus;
pub mod matching;
pub mod queue;
pub mod registry;
pub mod scheduler;

pub use bus::{EventBus, QueueEvent};
pub use queue::{PendingAck, QueueConfig, ResponsePayload, TaskQueue};
pub use registry::{Delivery, WaitingAgent};
pub use scheduler::{Scheduler, SchedulerConfig};
