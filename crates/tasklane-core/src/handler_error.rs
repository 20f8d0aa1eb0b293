//! Handler execution error types
//!
//! This module provides the error type returned by task handlers, allowing
//! a handler to indicate whether its failure is recoverable (should be
//! retried) or unrecoverable (should fail immediately without retrying).

use std::fmt;

/// Handler error that can be either recoverable or unrecoverable.
#[derive(Debug)]
pub struct HandlerError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl HandlerError {
    /// Create a new unrecoverable handler error.
    ///
    /// Unrecoverable errors fail the task immediately without retrying.
    /// Use this for errors like:
    /// - Missing or invalid configuration
    /// - Invalid input data that won't change on retry
    /// - Authorization/permission errors
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// Create a new recoverable handler error.
    ///
    /// Recoverable errors are retried according to the task's retry policy.
    /// Use this for errors like:
    /// - Transient network failures
    /// - Temporary resource unavailability
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    /// Check if this error is recoverable (should be retried).
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Get the inner error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Consume self and return the inner error.
    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }

    /// Full error chain, for tracebacks stored in the result backend.
    pub fn traceback(&self) -> String {
        format!("{:?}", self.inner)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for HandlerError {
    /// Default conversion from anyhow::Error creates a recoverable error.
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

/// Extension trait for Result to easily create unrecoverable handler errors.
pub trait HandlerResultExt<T> {
    /// Mark this result as unrecoverable on error.
    fn unrecoverable(self) -> Result<T, HandlerError>;
}

impl<T, E: Into<anyhow::Error>> HandlerResultExt<T> for Result<T, E> {
    fn unrecoverable(self) -> Result<T, HandlerError> {
        self.map_err(|e| HandlerError::unrecoverable(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecoverable_error() {
        let err = HandlerError::unrecoverable(anyhow::anyhow!("Missing API key"));
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("Missing API key"));
    }

    #[test]
    fn test_recoverable_error() {
        let err = HandlerError::recoverable(anyhow::anyhow!("Network timeout"));
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("Network timeout"));
    }

    #[test]
    fn test_from_anyhow() {
        let err: HandlerError = anyhow::anyhow!("Some error").into();
        assert!(err.is_recoverable(), "Default should be recoverable");
    }

    #[test]
    fn test_result_ext() {
        let result: Result<(), anyhow::Error> = Err(anyhow::anyhow!("Config error"));
        let handler_result = result.unrecoverable();
        assert!(handler_result.is_err());
        assert!(!handler_result.unwrap_err().is_recoverable());
    }

    #[test]
    fn test_traceback_contains_context() {
        use anyhow::Context;
        let result: Result<(), anyhow::Error> =
            Err(anyhow::anyhow!("connect refused")).context("fetching source");
        let err = HandlerError::recoverable(result.unwrap_err());
        let traceback = err.traceback();
        assert!(traceback.contains("fetching source"));
        assert!(traceback.contains("connect refused"));
    }
}
