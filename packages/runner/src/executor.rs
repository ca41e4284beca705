//! Worker pool draining the invocation queue.
//!
//! Each worker pops an invocation, applies pre-execution deduplication,
//! claims a governor slot, and runs the task lifecycle (validate, execute)
//! bounded by the descriptor timeout and the shutdown token. Failures are
//! classified and either retried with exponential backoff or dead-lettered;
//! panics are caught at the task boundary so tasks can never take a worker
//! down with them.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::MonitoringDedupMode;
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use crate::descriptor::TaskDescriptor;
use crate::governor::ConcurrencyGovernor;
use crate::invocation::{ExecutionOutcome, ExecutionRecord, Invocation};
use crate::metrics::MetricsRecorder;
use crate::platform::EnabledFlags;
use crate::queue::{InvocationQueue, PushOutcome};
use crate::registry::TaskRegistry;
use crate::task::{TaskContext, Validation};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub(crate) struct ExecutorConfig {
    /// Number of worker loops.
    pub workers: usize,
    /// Consecutive failed acquisitions before a worker backs off.
    pub acquire_failure_threshold: u32,
    /// Back-pressure sleep after repeated failed acquisitions.
    pub acquire_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            acquire_failure_threshold: 3,
            acquire_backoff: Duration::from_millis(10),
        }
    }
}

/// Bookkeeping for one in-flight execution.
struct RunningExecution {
    invocation: Invocation,
    started_at: DateTime<Utc>,
}

enum HandleResult {
    Done,
    /// Governor was at capacity; the invocation went back to the queue.
    Requeued,
}

/// How one task run ended, before the retry decision.
enum TaskRun {
    Success(u64),
    SkippedValidation(String),
    Failed(anyhow::Error),
    TimedOut,
    Cancelled,
    Panicked(String),
}

pub(crate) struct Executor {
    registry: Arc<TaskRegistry>,
    queue: Arc<InvocationQueue>,
    governor: Arc<ConcurrencyGovernor>,
    metrics: Arc<MetricsRecorder>,
    dead_letter: Arc<DeadLetterQueue>,
    clock: Arc<dyn Clock>,
    enabled: Arc<EnabledFlags>,
    config: ExecutorConfig,
    /// Cancelled at the graceful deadline; stops worker loops, in-flight
    /// executions, and pending retry timers.
    work_cancel: CancellationToken,
    running: Mutex<HashMap<Uuid, RunningExecution>>,
}

impl Executor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        queue: Arc<InvocationQueue>,
        governor: Arc<ConcurrencyGovernor>,
        metrics: Arc<MetricsRecorder>,
        dead_letter: Arc<DeadLetterQueue>,
        clock: Arc<dyn Clock>,
        enabled: Arc<EnabledFlags>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            governor,
            metrics,
            dead_letter,
            clock,
            enabled,
            config,
            work_cancel: CancellationToken::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn_workers(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let executor = self.clone();
                tokio::spawn(async move { executor.worker_loop(worker).await })
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    pub fn busy(&self) -> usize {
        self.running_lock().len()
    }

    /// Cancel worker loops, in-flight executions, and pending timers.
    pub fn cancel_work(&self) {
        self.work_cancel.cancel();
    }

    /// Drop bookkeeping for executions whose workers were aborted, recording
    /// each as cancelled. Returns how many were abandoned.
    pub fn abandon_running(&self) -> usize {
        let entries: Vec<RunningExecution> = {
            let mut running = self.running_lock();
            running.drain().map(|(_, entry)| entry).collect()
        };
        let now = self.clock.now();
        for entry in &entries {
            self.governor.release(&entry.invocation.job_type);
            self.metrics.record(ExecutionRecord {
                invocation_id: entry.invocation.id,
                job_type: entry.invocation.job_type.clone(),
                started_at: entry.started_at,
                ended_at: now,
                outcome: ExecutionOutcome::Cancelled,
                error_summary: Some("abandoned at shutdown".to_string()),
                items_processed: 0,
            });
        }
        entries.len()
    }

    /// Push an invocation after a delay (external `not_before` enqueues).
    pub fn push_later(&self, invocation: Invocation, delay: Duration) {
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        let clock = self.clock.clone();
        let cancel = self.work_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = clock.sleep(delay) => {
                    let job_type = invocation.job_type.clone();
                    match queue.push(invocation) {
                        PushOutcome::Duplicate(_) => metrics.record_dedup_drop(&job_type),
                        PushOutcome::Closed => {
                            debug!(job_type = %job_type, "queue closed, dropping delayed invocation");
                        }
                        PushOutcome::Enqueued(_) => {}
                    }
                }
            }
        });
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker started");
        let mut acquire_failures: u32 = 0;
        loop {
            let invocation = tokio::select! {
                biased;
                _ = self.work_cancel.cancelled() => break,
                popped = self.queue.pop() => match popped {
                    Some(invocation) => invocation,
                    None => break,
                },
            };

            match self.handle(invocation).await {
                HandleResult::Requeued => {
                    acquire_failures += 1;
                    if acquire_failures >= self.config.acquire_failure_threshold {
                        self.clock.sleep(self.config.acquire_backoff).await;
                        acquire_failures = 0;
                    }
                }
                HandleResult::Done => acquire_failures = 0,
            }
        }
        debug!(worker, "worker stopped");
    }

    async fn handle(&self, invocation: Invocation) -> HandleResult {
        let job_type = invocation.job_type.clone();
        let Some(descriptor) = self.registry.get(&job_type).cloned() else {
            error!(
                critical = true,
                job_type = %job_type,
                "popped invocation for unregistered job type"
            );
            self.metrics.record_platform_bug();
            return HandleResult::Done;
        };

        // A disable may race a pop or requeue; anything already in hand for a
        // disabled type is dropped here rather than executed.
        if !self.enabled.is_enabled(&job_type) {
            debug!(
                job_type = %job_type,
                invocation_id = %invocation.id,
                "dropping invocation for disabled type"
            );
            return HandleResult::Done;
        }

        // Pre-execution dedup: under strict monitoring, an invocation popped
        // while a same-type execution is in flight is redundant.
        if self.governor.mode() == MonitoringDedupMode::Strict
            && self.governor.is_monitoring(&job_type)
            && self.governor.in_flight(&job_type) > 0
        {
            debug!(
                job_type = %job_type,
                invocation_id = %invocation.id,
                "dropping redundant monitoring invocation"
            );
            let now = self.clock.now();
            self.metrics.record(ExecutionRecord {
                invocation_id: invocation.id,
                job_type,
                started_at: now,
                ended_at: now,
                outcome: ExecutionOutcome::SkippedDedup,
                error_summary: None,
                items_processed: 0,
            });
            return HandleResult::Done;
        }

        if !self.governor.try_acquire(&job_type) {
            match self.queue.requeue(invocation) {
                PushOutcome::Duplicate(_) => self.metrics.record_dedup_drop(&job_type),
                PushOutcome::Closed => {
                    debug!(job_type = %job_type, "queue closed while requeueing");
                }
                PushOutcome::Enqueued(_) => {}
            }
            return HandleResult::Requeued;
        }

        self.run_acquired(descriptor, invocation).await;
        HandleResult::Done
    }

    async fn run_acquired(&self, descriptor: TaskDescriptor, invocation: Invocation) {
        let job_type = invocation.job_type.clone();
        let started_at = self.clock.now();
        let cancel = self.work_cancel.child_token();

        self.running_lock().insert(
            invocation.id,
            RunningExecution {
                invocation: invocation.clone(),
                started_at,
            },
        );

        let run = self.run_task(&descriptor, &invocation, &cancel, started_at).await;

        self.running_lock().remove(&invocation.id);
        self.governor.release(&job_type);

        let ended_at = self.clock.now();
        let (outcome, error_summary, items_processed) = match run {
            TaskRun::Success(items) => {
                debug!(
                    job_type = %job_type,
                    invocation_id = %invocation.id,
                    items_processed = items,
                    "job succeeded"
                );
                (ExecutionOutcome::Success, None, items)
            }
            TaskRun::SkippedValidation(reason) => {
                debug!(
                    job_type = %job_type,
                    invocation_id = %invocation.id,
                    reason = %reason,
                    "validation skipped execution"
                );
                (ExecutionOutcome::SkippedValidation, Some(reason), 0)
            }
            TaskRun::Cancelled => {
                info!(
                    job_type = %job_type,
                    invocation_id = %invocation.id,
                    "job cancelled during shutdown"
                );
                (
                    ExecutionOutcome::Cancelled,
                    Some("cancelled during shutdown".to_string()),
                    0,
                )
            }
            TaskRun::TimedOut => {
                let summary = format!(
                    "execution exceeded {}ms timeout",
                    descriptor.timeout.as_millis()
                );
                warn!(
                    job_type = %job_type,
                    invocation_id = %invocation.id,
                    attempt = invocation.attempt,
                    "job timed out"
                );
                // A timed-out non-idempotent task may already have committed
                // side effects, so the timeout is terminal for it.
                if descriptor.idempotent && invocation.attempt <= descriptor.max_retries {
                    self.schedule_retry(&descriptor, &invocation);
                } else {
                    self.dead_letter_push(&invocation, &summary, ended_at);
                }
                (ExecutionOutcome::TimedOut, Some(summary), 0)
            }
            TaskRun::Failed(err) => {
                let kind = descriptor.task.classify_error(&err);
                let summary = format!("{err:#}");
                warn!(
                    job_type = %job_type,
                    invocation_id = %invocation.id,
                    attempt = invocation.attempt,
                    error = %summary,
                    ?kind,
                    "job failed"
                );
                if kind.should_retry() && invocation.attempt <= descriptor.max_retries {
                    self.schedule_retry(&descriptor, &invocation);
                    (ExecutionOutcome::FailedRetryable, Some(summary), 0)
                } else {
                    self.dead_letter_push(&invocation, &summary, ended_at);
                    (ExecutionOutcome::FailedTerminal, Some(summary), 0)
                }
            }
            TaskRun::Panicked(summary) => {
                error!(
                    job_type = %job_type,
                    invocation_id = %invocation.id,
                    error = %summary,
                    "task panicked"
                );
                self.dead_letter_push(&invocation, &summary, ended_at);
                (ExecutionOutcome::FailedTerminal, Some(summary), 0)
            }
        };

        self.metrics.record(ExecutionRecord {
            invocation_id: invocation.id,
            job_type,
            started_at,
            ended_at,
            outcome,
            error_summary,
            items_processed,
        });
    }

    /// Run validate then execute, bounded by the timeout and shutdown token.
    async fn run_task(
        &self,
        descriptor: &TaskDescriptor,
        invocation: &Invocation,
        cancel: &CancellationToken,
        started_at: DateTime<Utc>,
    ) -> TaskRun {
        let task = descriptor.task.clone();

        let validation = match AssertUnwindSafe(task.validate(invocation)).catch_unwind().await {
            Err(panic) => return TaskRun::Panicked(panic_summary(panic)),
            Ok(Err(err)) => return TaskRun::Failed(err),
            Ok(Ok(validation)) => validation,
        };
        if let Validation::Skip(reason) = validation {
            return TaskRun::SkippedValidation(reason);
        }

        let ctx = TaskContext {
            cancel: cancel.clone(),
            deadline: started_at + descriptor.timeout,
            batch_size: descriptor.batch_size,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => TaskRun::Cancelled,
            _ = self.clock.sleep(descriptor.timeout) => TaskRun::TimedOut,
            result = AssertUnwindSafe(task.execute(invocation, &ctx)).catch_unwind() => {
                match result {
                    Err(panic) => TaskRun::Panicked(panic_summary(panic)),
                    Ok(Err(err)) => TaskRun::Failed(err),
                    Ok(Ok(items)) => TaskRun::Success(items),
                }
            }
        }
    }

    fn schedule_retry(&self, descriptor: &TaskDescriptor, invocation: &Invocation) {
        let delay = retry_delay(
            descriptor.retry_backoff_base,
            descriptor.retry_backoff_max,
            invocation.attempt,
        );
        debug!(
            job_type = %invocation.job_type,
            attempt = invocation.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );

        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        let clock = self.clock.clone();
        let cancel = self.work_cancel.clone();
        let descriptor = descriptor.clone();
        let invocation = invocation.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = clock.sleep(delay) => {
                    let retry = invocation.next_retry(&descriptor, clock.now());
                    match queue.push(retry) {
                        PushOutcome::Duplicate(_) => {
                            metrics.record_dedup_drop(&invocation.job_type);
                        }
                        PushOutcome::Closed => {
                            debug!(job_type = %invocation.job_type, "queue closed, dropping retry");
                        }
                        PushOutcome::Enqueued(_) => {}
                    }
                }
            }
        });
    }

    fn dead_letter_push(&self, invocation: &Invocation, error: &str, at: DateTime<Utc>) {
        warn!(
            job_type = %invocation.job_type,
            invocation_id = %invocation.id,
            attempt = invocation.attempt,
            "moving job to dead letter queue"
        );
        let evicted = self.dead_letter.push(DeadLetterEntry {
            invocation: invocation.clone(),
            error: error.to_string(),
            dead_lettered_at: at,
        });
        if evicted.is_some() {
            self.metrics.record_dead_letter_eviction();
        }
        self.metrics.record_dead_lettered(&invocation.job_type);
    }

    fn running_lock(&self) -> MutexGuard<'_, HashMap<Uuid, RunningExecution>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Delay before retrying after failed attempt N: `base * 2^(N-1)`, capped.
pub(crate) fn retry_delay(base: Duration, max: Duration, failed_attempt: u32) -> Duration {
    let shift = failed_attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max)
}

fn panic_summary(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic: unknown payload".to_string()
    }
}
