//! Dead-letter queue: bounded in-memory ring of invocations that exhausted
//! their retries or failed terminally.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::invocation::Invocation;

/// A quarantined invocation with its final error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub invocation: Invocation,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Bounded ring; when full, the oldest entry is evicted and the eviction is
/// surfaced to the caller for recording.
pub struct DeadLetterQueue {
    inner: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: usize,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Quarantine an entry. Returns the evicted entry when the ring was full.
    pub fn push(&self, entry: DeadLetterEntry) -> Option<DeadLetterEntry> {
        let mut inner = self.lock();
        let evicted = if inner.len() == self.capacity {
            inner.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            warn!(
                job_type = %old.invocation.job_type,
                invocation_id = %old.invocation.id,
                "dead letter ring full, evicting oldest entry"
            );
        }
        inner.push_back(entry);
        evicted
    }

    /// Remove and return up to `n` entries, oldest first.
    pub fn drain(&self, n: usize) -> Vec<DeadLetterEntry> {
        let mut inner = self.lock();
        let take = n.min(inner.len());
        inner.drain(..take).collect()
    }

    /// Copy of all entries, oldest first.
    pub fn peek(&self) -> Vec<DeadLetterEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeadLetterEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::invocation::{InvocationSource, JobPriority};

    fn entry(tag: &str) -> DeadLetterEntry {
        let now = Utc::now();
        DeadLetterEntry {
            invocation: Invocation {
                id: Uuid::new_v4(),
                job_type: tag.to_string(),
                priority: JobPriority::Normal,
                enqueued_at: now,
                attempt: 2,
                source: InvocationSource::Retry,
                payload: None,
                dedup_key: None,
                deadline: now + Duration::from_secs(60),
            },
            error: "boom".to_string(),
            dead_lettered_at: now,
        }
    }

    #[test]
    fn push_and_peek_preserve_order() {
        let q = DeadLetterQueue::new(10);
        q.push(entry("first"));
        q.push(entry("second"));

        let entries = q.peek();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].invocation.job_type, "first");
        assert_eq!(entries[1].invocation.job_type, "second");
        assert_eq!(q.depth(), 2);
    }

    #[test]
    fn full_ring_evicts_oldest() {
        let q = DeadLetterQueue::new(2);
        assert!(q.push(entry("a")).is_none());
        assert!(q.push(entry("b")).is_none());

        let evicted = q.push(entry("c")).unwrap();
        assert_eq!(evicted.invocation.job_type, "a");
        assert_eq!(q.depth(), 2);
        assert_eq!(q.peek()[0].invocation.job_type, "b");
    }

    #[test]
    fn drain_removes_oldest_first() {
        let q = DeadLetterQueue::new(10);
        q.push(entry("a"));
        q.push(entry("b"));
        q.push(entry("c"));

        let drained = q.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].invocation.job_type, "a");
        assert_eq!(q.depth(), 1);

        assert_eq!(q.drain(10).len(), 1);
        assert_eq!(q.depth(), 0);
    }
}
