//! Observes queue-store depth and reports it; a monitoring-set type.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{message_dispatch, TaskDeps};
use crate::descriptor::TaskDescriptor;
use crate::invocation::{Invocation, JobPriority};
use crate::task::{Task, TaskContext};

pub const JOB_TYPE: &str = "queue_monitor";

/// Depth at which the backlog is worth a warning.
const BACKLOG_WARN_DEPTH: u64 = 500;

pub fn descriptor(deps: Arc<TaskDeps>) -> TaskDescriptor {
    TaskDescriptor::builder()
        .job_type(JOB_TYPE)
        .display_name("Queue Monitor")
        .description("Reports queue store depth")
        .interval(Duration::from_secs(15))
        .priority(JobPriority::Low)
        .max_retries(0)
        .requires(BTreeSet::from(["queue".to_string()]))
        .dependencies(BTreeSet::from([message_dispatch::JOB_TYPE.to_string()]))
        .task(Arc::new(QueueMonitorTask { deps }))
        .build()
}

struct QueueMonitorTask {
    deps: Arc<TaskDeps>,
}

#[async_trait]
impl Task for QueueMonitorTask {
    async fn execute(&self, _invocation: &Invocation, _ctx: &TaskContext) -> Result<u64> {
        let depth = self.deps.queue_store.pending_count().await?;
        if depth >= BACKLOG_WARN_DEPTH {
            warn!(depth, "message backlog is growing");
        } else {
            info!(depth, "queue depth");
        }
        Ok(0)
    }
}
