//! Drains pending messages from the queue store in batches.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::TaskDeps;
use crate::descriptor::TaskDescriptor;
use crate::invocation::{Invocation, JobPriority};
use crate::task::{Task, TaskContext, Validation};

pub const JOB_TYPE: &str = "message_dispatch";

pub fn descriptor(deps: Arc<TaskDeps>) -> TaskDescriptor {
    TaskDescriptor::builder()
        .job_type(JOB_TYPE)
        .display_name("Message Dispatch")
        .description("Processes queued messages in batches")
        .interval(Duration::from_secs(30))
        .priority(JobPriority::High)
        .batch_size(25)
        .requires(BTreeSet::from(["queue".to_string()]))
        .task(Arc::new(MessageDispatchTask { deps }))
        .build()
}

struct MessageDispatchTask {
    deps: Arc<TaskDeps>,
}

#[async_trait]
impl Task for MessageDispatchTask {
    async fn validate(&self, _invocation: &Invocation) -> Result<Validation> {
        let pending = self.deps.queue_store.pending_count().await?;
        if pending == 0 {
            return Ok(Validation::Skip("no messages pending".to_string()));
        }
        Ok(Validation::Ready)
    }

    async fn execute(&self, _invocation: &Invocation, ctx: &TaskContext) -> Result<u64> {
        let store = &self.deps.queue_store;
        let messages = store.claim(ctx.batch_size).await?;
        let mut processed = 0u64;

        for message in messages {
            if ctx.cancel.is_cancelled() {
                store.release(message.id).await?;
                break;
            }
            debug!(message_id = %message.id, kind = %message.kind, "dispatching message");
            store.complete(message.id).await?;
            processed += 1;
        }

        if processed > 0 {
            info!(processed, "dispatched messages");
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::store::{InMemoryQueueStore, QueueStore};

    fn setup() -> (Arc<InMemoryQueueStore>, TaskDescriptor) {
        let store = Arc::new(InMemoryQueueStore::new());
        let deps = Arc::new(TaskDeps {
            queue_store: store.clone(),
        });
        (store, descriptor(deps))
    }

    fn ctx(batch_size: u32) -> TaskContext {
        TaskContext {
            cancel: CancellationToken::new(),
            deadline: Utc::now() + Duration::from_secs(60),
            batch_size,
        }
    }

    #[tokio::test]
    async fn validate_skips_when_store_is_empty() {
        let (_store, descriptor) = setup();
        let invocation = Invocation::scheduled(&descriptor, Utc::now());

        let validation = descriptor.task.validate(&invocation).await.unwrap();
        assert!(matches!(validation, Validation::Skip(_)));
    }

    #[tokio::test]
    async fn execute_processes_a_batch() {
        let (store, descriptor) = setup();
        for n in 0..5 {
            store.push("notice", serde_json::json!({ "n": n }));
        }
        let invocation = Invocation::scheduled(&descriptor, Utc::now());

        let validation = descriptor.task.validate(&invocation).await.unwrap();
        assert_eq!(validation, Validation::Ready);

        let processed = descriptor.task.execute(&invocation, &ctx(3)).await.unwrap();
        assert_eq!(processed, 3);
        assert_eq!(store.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelled_execution_releases_unprocessed_messages() {
        let (store, descriptor) = setup();
        store.push("notice", serde_json::json!({}));
        let invocation = Invocation::scheduled(&descriptor, Utc::now());

        let context = ctx(10);
        context.cancel.cancel();
        let processed = descriptor
            .task
            .execute(&invocation, &context)
            .await
            .unwrap();

        assert_eq!(processed, 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }
}
