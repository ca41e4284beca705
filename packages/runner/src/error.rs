//! Error taxonomy for the job platform.
//!
//! Startup and enqueue failures are typed; task-level failures are classified
//! into [`ErrorKind`] at the executor boundary and never propagate out of the
//! worker pool.

use thiserror::Error;

/// A configuration key carried a value the platform cannot accept.
///
/// Raised both by the per-type environment overlay and by platform-wide
/// configuration loading. The platform refuses to start.
#[derive(Debug, Clone, Error)]
#[error("invalid config value {key}={value}: {reason}")]
pub struct ConfigOverrideInvalid {
    pub key: String,
    pub value: String,
    pub reason: String,
}

/// Errors raised while building or freezing the task registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate job type: {0}")]
    DuplicateJobType(String),

    #[error("invalid descriptor for {job_type}: {reason}")]
    InvalidDescriptor { job_type: String, reason: String },

    #[error("job type {job_type} depends on unregistered type {dependency}")]
    UnknownDependency {
        job_type: String,
        dependency: String,
    },

    #[error("registry is frozen")]
    RegistryFrozen,

    #[error(transparent)]
    ConfigOverrideInvalid(#[from] ConfigOverrideInvalid),
}

/// Errors returned by `JobPlatform::start`.
///
/// Any failure leaves the platform in its previous not-started state.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("platform is already running")]
    AlreadyStarted,

    #[error("startup failed: {0}")]
    Failed(#[from] RegistryError),
}

/// Errors returned synchronously by the external enqueue path.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("platform is not running")]
    NotRunning,

    #[error("platform has shut down")]
    Shutdown,

    #[error("unknown job type: {0}")]
    NotFound(String),

    #[error("job type {0} is disabled")]
    Disabled(String),

    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Classification of a task execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient error - retried while attempts remain.
    Retryable,
    /// Permanent error - dead-lettered immediately.
    NonRetryable,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry.
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}
