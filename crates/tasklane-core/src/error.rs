//! Error types module
//!
//! This module provides the core error types used throughout the Tasklane
//! engine. All engine errors are unified under the `EngineError` enum, which
//! carries the failure kind the caller needs for routing, retry, and
//! reporting decisions.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Queue full: {queue} at capacity {capacity}")]
    QueueFull { queue: String, capacity: usize },

    #[error("Shutting down")]
    Shutdown,

    #[error("Timed out")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Machine-readable error code for logs and monitors.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidTask(_) => "INVALID_TASK",
            EngineError::InvalidArgument(_) => "INVALID_ARGUMENT",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::QueueFull { .. } => "QUEUE_FULL",
            EngineError::Shutdown => "SHUTDOWN",
            EngineError::Timeout => "TIMEOUT",
            EngineError::Cancelled => "CANCELLED",
            EngineError::Handler(_) => "HANDLER_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
            EngineError::NotSupported(_) => "NOT_SUPPORTED",
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::InvalidTask(_) => false,
            EngineError::InvalidArgument(_) => false,
            EngineError::NotFound(_) => false,
            EngineError::QueueFull { .. } => true,
            EngineError::Shutdown => false,
            EngineError::Timeout => true,
            EngineError::Cancelled => false,
            EngineError::Handler(_) => true,
            EngineError::Internal(_) => true,
            EngineError::NotSupported(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes() {
        assert_eq!(
            EngineError::InvalidTask("empty name".into()).kind(),
            "INVALID_TASK"
        );
        assert_eq!(EngineError::NotFound("task".into()).kind(), "NOT_FOUND");
        assert_eq!(
            EngineError::QueueFull {
                queue: "default".into(),
                capacity: 10
            }
            .kind(),
            "QUEUE_FULL"
        );
        assert_eq!(EngineError::Shutdown.kind(), "SHUTDOWN");
        assert_eq!(EngineError::Timeout.kind(), "TIMEOUT");
        assert_eq!(EngineError::Cancelled.kind(), "CANCELLED");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(EngineError::Timeout.is_recoverable());
        assert!(EngineError::Handler("boom".into()).is_recoverable());
        assert!(EngineError::QueueFull {
            queue: "default".into(),
            capacity: 10
        }
        .is_recoverable());
        assert!(!EngineError::InvalidTask("bad".into()).is_recoverable());
        assert!(!EngineError::Cancelled.is_recoverable());
        assert!(!EngineError::Shutdown.is_recoverable());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = EngineError::QueueFull {
            queue: "video".into(),
            capacity: 128,
        };
        let text = err.to_string();
        assert!(text.contains("video"));
        assert!(text.contains("128"));
    }
}
