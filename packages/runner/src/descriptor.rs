//! Task descriptor: the immutable registration record for one job type.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::invocation::JobPriority;
use crate::task::Task;

/// Registration record for one job type.
///
/// Built once by the task's registration function, normalized and validated by
/// the registry, and never mutated after the registry is frozen.
#[derive(Clone, TypedBuilder)]
pub struct TaskDescriptor {
    /// Unique identifier for this job type.
    #[builder(setter(into))]
    pub job_type: String,

    #[builder(setter(into))]
    pub display_name: String,

    #[builder(default, setter(into))]
    pub description: String,

    /// Scheduling interval; `Duration::ZERO` means enqueue-only.
    #[builder(default = Duration::ZERO)]
    pub interval: Duration,

    #[builder(default)]
    pub priority: JobPriority,

    #[builder(default = true)]
    pub enabled: bool,

    #[builder(default = 3)]
    pub max_retries: u32,

    /// Retry N waits `retry_backoff_base * 2^(N-1)`, capped by
    /// `retry_backoff_max`.
    #[builder(default = Duration::from_secs(30))]
    pub retry_backoff_base: Duration,

    #[builder(default = Duration::from_secs(900))]
    pub retry_backoff_max: Duration,

    /// Per-execution wall-clock ceiling.
    #[builder(default = Duration::from_secs(300))]
    pub timeout: Duration,

    /// Capacity for simultaneous in-flight executions of this type.
    #[builder(default = 1)]
    pub max_concurrent: u32,

    /// Hint passed through to the task; the platform does not enforce it.
    #[builder(default = 10)]
    pub batch_size: u32,

    /// Advisory capability tags, surfaced in health output.
    #[builder(default)]
    pub requires: BTreeSet<String>,

    /// Other job types that must be registered in the same discovery pass.
    #[builder(default)]
    pub dependencies: BTreeSet<String>,

    /// Serve invocations of this type in strict FIFO order; forces
    /// `max_concurrent` to 1.
    #[builder(default = false)]
    pub preserve_order: bool,

    /// When false, timeouts are terminal: a retry could repeat committed
    /// side effects.
    #[builder(default = true)]
    pub idempotent: bool,

    pub task: Arc<dyn Task>,
}

impl TaskDescriptor {
    /// Whether the scheduler should run a ticker for this type.
    pub fn is_scheduled(&self) -> bool {
        self.interval > Duration::ZERO
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("job_type", &self.job_type)
            .field("display_name", &self.display_name)
            .field("interval", &self.interval)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_base", &self.retry_backoff_base)
            .field("retry_backoff_max", &self.retry_backoff_max)
            .field("timeout", &self.timeout)
            .field("max_concurrent", &self.max_concurrent)
            .field("batch_size", &self.batch_size)
            .field("requires", &self.requires)
            .field("dependencies", &self.dependencies)
            .field("preserve_order", &self.preserve_order)
            .field("idempotent", &self.idempotent)
            .finish_non_exhaustive()
    }
}
