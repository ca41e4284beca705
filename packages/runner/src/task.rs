//! Task contract: the operations the platform expects from every job type.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::invocation::Invocation;

/// Result of a pre-execution validation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The task has work to do and should execute.
    Ready,
    /// Nothing to do right now; the invocation is skipped with the reason
    /// recorded. This is the normal idle case for queue-processing tasks.
    Skip(String),
}

/// Per-execution context handed to `Task::execute`.
///
/// Tasks are contractually required to check `cancel` between I/O steps; the
/// executor additionally bounds the whole call by the descriptor timeout.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub cancel: CancellationToken,
    pub deadline: DateTime<Utc>,
    /// Batch-size hint from the descriptor; not enforced by the platform.
    pub batch_size: u32,
}

/// A registered job type's implementation.
#[async_trait]
pub trait Task: Send + Sync {
    /// Cheap, side-effect-free check whether there is work to do.
    async fn validate(&self, _invocation: &Invocation) -> Result<Validation> {
        Ok(Validation::Ready)
    }

    /// Run the task. Returns the number of items processed.
    ///
    /// Must honor `ctx.cancel` within the descriptor timeout; the executor
    /// drops the call at the deadline either way.
    async fn execute(&self, invocation: &Invocation, ctx: &TaskContext) -> Result<u64>;

    /// Classify an execution error for the retry decision.
    fn classify_error(&self, error: &anyhow::Error) -> ErrorKind {
        classify_error(error)
    }
}

/// Default error classification used when a task does not override it.
///
/// Returns `Retryable` for transient errors that may succeed on retry,
/// and `NonRetryable` for permanent failures.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    let error_str = error.to_string().to_lowercase();

    // Non-retryable: validation errors, not found, permission denied
    if error_str.contains("not found")
        || error_str.contains("invalid")
        || error_str.contains("permission denied")
        || error_str.contains("unauthorized")
        || error_str.contains("forbidden")
    {
        return ErrorKind::NonRetryable;
    }

    // Non-retryable: malformed payloads
    if error_str.contains("deserialize") || error_str.contains("parse") {
        return ErrorKind::NonRetryable;
    }

    // Everything else is retryable (network errors, timeouts, etc.)
    ErrorKind::Retryable
}
