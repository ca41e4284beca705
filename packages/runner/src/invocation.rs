//! Invocation model: one attempt to run a registered job type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descriptor::TaskDescriptor;

// ============================================================================
// Enums
// ============================================================================

/// Scheduling priority of a job type or a single invocation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Convert to integer rank for ordering (lower = higher priority).
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

/// How an invocation entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationSource {
    /// Produced by the scheduler's interval ticker.
    Scheduled,
    /// Produced by `JobPlatform::enqueue`.
    External,
    /// Produced by the executor after a retryable failure.
    Retry,
}

/// Terminal outcome of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    FailedRetryable,
    FailedTerminal,
    SkippedValidation,
    SkippedDedup,
    TimedOut,
    Cancelled,
}

impl ExecutionOutcome {
    /// Whether the invocation actually ran (as opposed to being skipped).
    pub fn is_execution(&self) -> bool {
        !matches!(
            self,
            ExecutionOutcome::SkippedValidation | ExecutionOutcome::SkippedDedup
        )
    }
}

// ============================================================================
// Invocation
// ============================================================================

/// One scheduled, enqueued, or retried attempt to run a job type.
///
/// Created by the scheduler or the enqueue path, consumed exactly once by a
/// worker, and destroyed after metrics recording (the dead-letter queue keeps
/// a copy for jobs that exhaust their retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: Uuid,
    pub job_type: String,
    pub priority: JobPriority,
    pub enqueued_at: DateTime<Utc>,
    /// 1-based attempt counter; never exceeds `max_retries + 1`.
    pub attempt: u32,
    pub source: InvocationSource,
    /// Opaque payload from the enqueuer; `None` for scheduled invocations.
    pub payload: Option<serde_json::Value>,
    /// Pending invocations of one type with the same key are collapsed to one.
    pub dedup_key: Option<String>,
    pub deadline: DateTime<Utc>,
}

impl Invocation {
    /// Build a scheduler-produced invocation for a tick of `descriptor`.
    ///
    /// Scheduled invocations default their dedup key to the job type, so a
    /// tick can never stack behind an identical pending tick.
    pub fn scheduled(descriptor: &TaskDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: descriptor.job_type.clone(),
            priority: descriptor.priority,
            enqueued_at: now,
            attempt: 1,
            source: InvocationSource::Scheduled,
            payload: None,
            dedup_key: Some(descriptor.job_type.clone()),
            deadline: now + descriptor.timeout,
        }
    }

    /// Build an externally enqueued invocation.
    pub fn external(
        descriptor: &TaskDescriptor,
        now: DateTime<Utc>,
        priority: JobPriority,
        payload: Option<serde_json::Value>,
        dedup_key: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: descriptor.job_type.clone(),
            priority,
            enqueued_at: now,
            attempt: 1,
            source: InvocationSource::External,
            payload,
            dedup_key,
            deadline: now + descriptor.timeout,
        }
    }

    /// Build the follow-up invocation for a retryable failure of `self`.
    pub fn next_retry(&self, descriptor: &TaskDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: self.job_type.clone(),
            priority: self.priority,
            enqueued_at: now,
            attempt: self.attempt + 1,
            source: InvocationSource::Retry,
            payload: self.payload.clone(),
            dedup_key: self.dedup_key.clone(),
            deadline: now + descriptor.timeout,
        }
    }
}

/// Emitted to the metrics recorder for every invocation that reached a
/// terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub invocation_id: Uuid,
    pub job_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    pub error_summary: Option<String>,
    pub items_processed: u64,
}

impl ExecutionRecord {
    /// Execution duration in whole milliseconds (zero when clocks disagree).
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}
