//! Message-store port consumed by queue-processing tasks.
//!
//! The platform core neither reads nor writes this store; tasks use it from
//! `validate` (is there anything to do?) and `execute` (claim and consume a
//! batch). Production hosts back it with their own persistence; the bundled
//! in-memory implementation serves the host binary and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One message awaiting processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    /// Free-form kind tag chosen by the producer.
    pub kind: String,
    pub body: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

/// Store of pending messages for queue-processing tasks.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Messages currently waiting (excluding claimed ones).
    async fn pending_count(&self) -> Result<u64>;

    /// Claim up to `limit` messages for processing, oldest first.
    async fn claim(&self, limit: u32) -> Result<Vec<QueueMessage>>;

    /// Mark a claimed message as processed.
    async fn complete(&self, id: Uuid) -> Result<()>;

    /// Return a claimed message to the pending pool (e.g. on cancellation).
    async fn release(&self, id: Uuid) -> Result<()>;
}

#[derive(Default)]
struct StoreInner {
    pending: VecDeque<QueueMessage>,
    claimed: HashMap<Uuid, QueueMessage>,
}

/// In-memory store used by the host binary and tests.
#[derive(Default)]
pub struct InMemoryQueueStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side: append a message.
    pub fn push(&self, kind: impl Into<String>, body: serde_json::Value) -> Uuid {
        let message = QueueMessage {
            id: Uuid::new_v4(),
            kind: kind.into(),
            body,
            queued_at: Utc::now(),
        };
        let id = message.id;
        self.lock().pending.push_back(message);
        id
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn pending_count(&self) -> Result<u64> {
        Ok(self.lock().pending.len() as u64)
    }

    async fn claim(&self, limit: u32) -> Result<Vec<QueueMessage>> {
        let mut inner = self.lock();
        let take = (limit as usize).min(inner.pending.len());
        let claimed: Vec<QueueMessage> = inner.pending.drain(..take).collect();
        for message in &claimed {
            inner.claimed.insert(message.id, message.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        if self.lock().claimed.remove(&id).is_none() {
            bail!("message {id} is not claimed");
        }
        Ok(())
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        match inner.claimed.remove(&id) {
            Some(message) => {
                inner.pending.push_front(message);
                Ok(())
            }
            None => bail!("message {id} is not claimed"),
        }
    }
}
