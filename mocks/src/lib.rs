//! Test doubles for the dispatch server
//!
//! An in-memory [`MockStore`] implementing every repository trait, with
//! error injection, call tracking, and direct-mutation helpers that let
//! scheduler tests fabricate timestamps deterministically. Builders provide
//! fluent fixtures.

pub mod builders;
pub mod store;

pub use builders::{AgentBuilder, TaskBuilder};
pub use store::MockStore;
