//! Tasklane Core Library
//!
//! This crate provides the domain models, error types, configuration, and
//! payload container shared across all Tasklane components.

pub mod config;
pub mod error;
pub mod handler_error;
pub mod hooks;
pub mod models;
pub mod payload;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use handler_error::{HandlerError, HandlerResultExt};
pub use hooks::{MetricsSink, NoOpMetricsSink, WorkerMetrics};
pub use payload::{Payload, Value};
