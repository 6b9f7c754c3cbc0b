//! Domain error model.

use std::time::Duration;

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic validation failures. Storage and
/// execution concerns have their own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Why a single task execution did not succeed.
///
/// Every variant is recovered locally: the run loop converts it into backoff
/// state and moves on to the next task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler exceeded the maximum runtime and was abandoned.
    #[error("exceeded maximum runtime of {}s", limit.as_secs_f64())]
    Timeout { limit: Duration },

    /// No handler is registered for the record's classname.
    #[error("no handler registered for {0}")]
    MissingHandler(String),
}

impl TaskFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskFailure::Timeout { .. })
    }
}

/// A concurrency reservation was refused because a ceiling is reached.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LimitDenied {
    #[error("{classname} has {running} running instances (limit {limit})")]
    PerClass {
        classname: String,
        running: usize,
        limit: usize,
    },

    #[error("{running} ad-hoc tasks running (global limit {limit})")]
    Global { running: usize, limit: usize },

    #[error("{running} blocking ad-hoc tasks running (blocking limit {limit})")]
    Blocking { running: usize, limit: usize },
}
