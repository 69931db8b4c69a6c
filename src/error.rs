//! Error types for taskpool operations.
//!
//! Two families live here:
//! - [`TaskError`]: failures attached to a task and shipped with its result
//! - [`QueueError`] and [`RegistryError`]: failures returned to the caller of
//!   a pool or registry operation

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Failure recorded on a task.
///
/// Serialized into the output record, so a waiter in another process sees the
/// same variant the worker recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum TaskError {
    /// A required precondition did not hold (missing id, missing output).
    #[error("Incorrect state: {0}")]
    IncorrectState(String),

    /// The task was invoked more than once.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The job raised an error outside this taxonomy.
    #[error("{0}")]
    Runtime(String),

    /// The job reported a failure of its own.
    #[error("Task failed: {0}")]
    Failed(String),
}

impl TaskError {
    /// Shorthand for a job-declared failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Wraps a foreign error into the runtime variant.
    pub fn runtime(err: &anyhow::Error) -> Self {
        Self::Runtime(format!("Uncaught exception: {:#}", err))
    }
}

/// Errors returned by queue pool operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No completion signal arrived within the caller's window.
    #[error("Wait timed out after {0:?}")]
    WaitTimeout(Duration),

    /// A precondition of the operation did not hold.
    #[error("Incorrect state: {0}")]
    IncorrectState(String),

    /// The backing store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A task record could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The job kind of a record is unknown or its payload is malformed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The task itself refused the operation, e.g. a second invocation.
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// The blocking pool could not start its runtime.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl QueueError {
    /// Returns true for errors a caller may retry after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WaitTimeout(_) | Self::Store(_))
    }
}

/// Errors that can occur while resolving job kinds.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Job kind '{0}' is not registered")]
    UnknownKind(String),

    #[error("Job kind '{0}' is already registered")]
    DuplicateKind(String),

    #[error("Invalid arguments for '{kind}': {message}")]
    InvalidArguments { kind: String, message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
