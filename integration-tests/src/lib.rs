//! End-to-end tests for the dispatch server live in `tests/`; this crate
//! intentionally exports nothing.
