//! Database layer for the dispatch server
//!
//! SQLite implementation of the `dispatch-core` repository traits, backed
//! by `sqlx` with connection pooling and embedded migrations. This crate is
//! the only code that touches columns; everything above it speaks in domain
//! types.

pub mod common;
pub mod sqlite;

pub use sqlite::SqliteStore;
