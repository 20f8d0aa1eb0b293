//! Tasklane Infrastructure
//!
//! Process-level concerns that sit outside the engine core: telemetry
//! initialization for binaries embedding the task system.

pub mod telemetry;

pub use telemetry::{init_telemetry, shutdown_telemetry};
