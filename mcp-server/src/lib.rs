//! Dispatch server binary support library
//!
//! Exposes configuration, telemetry, and wiring helpers so integration
//! tests can assemble the same stack the `synapse-mcp` binary runs.

pub mod config;
pub mod setup;
pub mod telemetry;
