// Job Execution Platform
//
// In-process, priority-driven scheduler and worker pool for background jobs.
// Task types are registered at startup, scheduled on fixed intervals or
// enqueued on demand, executed under per-type concurrency limits with
// deduplication, retry with backoff, and a dead-letter queue for jobs that
// exhaust their retries.
//
// External collaborators (HTTP server, SQL message store, chain/AI clients)
// talk to the platform exclusively through [`JobPlatform`] and the ports in
// [`clock`], [`config`], and [`store`].

pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod descriptor;
pub mod error;
mod executor;
pub mod governor;
pub mod health;
pub mod invocation;
pub mod metrics;
pub mod platform;
pub mod queue;
pub mod registry;
mod scheduler;
pub mod store;
pub mod task;
pub mod tasks;
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use config::{ConfigSource, EnvConfigSource, MonitoringDedupMode, PlatformConfig};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use descriptor::TaskDescriptor;
pub use error::{ConfigOverrideInvalid, EnqueueError, ErrorKind, RegistryError, StartupError};
pub use health::{HealthSnapshot, HealthStatus, TypeHealth, WorkerHealth};
pub use invocation::{
    ExecutionOutcome, ExecutionRecord, Invocation, InvocationSource, JobPriority,
};
pub use metrics::{DurationStats, MetricsRecorder, MetricsSnapshot, TypeMetricsSnapshot};
pub use platform::{EnqueueOptions, JobPlatform};
pub use queue::{InvocationQueue, PushOutcome};
pub use registry::TaskRegistry;
pub use store::{InMemoryQueueStore, QueueMessage, QueueStore};
pub use task::{Task, TaskContext, Validation};
