//! Top-level facade composing the registry, queue, governor, scheduler,
//! executor, metrics, and dead-letter queue.
//!
//! The platform owns every component; nothing here is process-global. Hosts
//! build a [`crate::registry::TaskRegistry`] in a discovery pass, hand it to
//! [`JobPlatform::new`], and drive the lifecycle with `start` / `stop`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigSource, EnvConfigSource, PlatformConfig};
use crate::dead_letter::DeadLetterQueue;
use crate::error::{EnqueueError, StartupError};
use crate::executor::{Executor, ExecutorConfig};
use crate::governor::ConcurrencyGovernor;
use crate::health::{derive_status, HealthInputs, HealthSnapshot, TypeHealth, WorkerHealth};
use crate::invocation::{ExecutionRecord, Invocation, JobPriority};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::queue::{InvocationQueue, PushOutcome};
use crate::registry::TaskRegistry;
use crate::scheduler::{Scheduler, SchedulerContext};

/// Extra wait after the graceful deadline before workers are aborted.
const HARD_KILL_GRACE: Duration = Duration::from_secs(5);

/// Options for [`JobPlatform::enqueue`].
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct EnqueueOptions {
    #[builder(default)]
    pub priority_override: Option<JobPriority>,
    /// Collapses with any pending invocation of the same type and key.
    #[builder(default, setter(into, strip_option))]
    pub dedup_key: Option<String>,
    /// Delay the push until this instant.
    #[builder(default)]
    pub not_before: Option<DateTime<Utc>>,
}

/// Runtime enabled flags, toggled without re-registration.
///
/// Descriptors are immutable after the registry freezes; this map carries the
/// one piece of per-type state that admin operations may flip at runtime.
pub(crate) struct EnabledFlags {
    flags: HashMap<String, AtomicBool>,
}

impl EnabledFlags {
    pub fn from_registry(registry: &TaskRegistry) -> Self {
        Self {
            flags: registry
                .list()
                .into_iter()
                .map(|d| (d.job_type.clone(), AtomicBool::new(d.enabled)))
                .collect(),
        }
    }

    pub fn is_enabled(&self, job_type: &str) -> bool {
        self.flags
            .get(job_type)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Returns false for unknown types.
    pub fn set(&self, job_type: &str, enabled: bool) -> bool {
        match self.flags.get(job_type) {
            Some(flag) => {
                flag.store(enabled, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct RunningCore {
    registry: Arc<TaskRegistry>,
    queue: Arc<InvocationQueue>,
    governor: Arc<ConcurrencyGovernor>,
    executor: Arc<Executor>,
    enabled: Arc<EnabledFlags>,
    scheduler_shutdown: CancellationToken,
    scheduler_handles: Vec<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
    started_at: DateTime<Utc>,
}

struct PlatformState {
    phase: Phase,
    core: Option<RunningCore>,
}

/// The job execution platform.
///
/// `start` applies the environment overlay, freezes the per-run registry, and
/// brings up workers and tickers; `stop` drains gracefully and abandons
/// stragglers past the hard threshold. Restartable: `start` after `stop`
/// rebuilds the run from the same registered descriptor set with the overlay
/// re-applied.
pub struct JobPlatform {
    base_registry: TaskRegistry,
    config: PlatformConfig,
    config_source: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRecorder>,
    dead_letter: Arc<DeadLetterQueue>,
    state: Mutex<PlatformState>,
}

impl JobPlatform {
    /// Build a platform over the given discovery-pass registry, using the
    /// system clock and process environment.
    pub fn new(registry: TaskRegistry, config: PlatformConfig) -> Self {
        Self::with_deps(
            registry,
            config,
            Arc::new(SystemClock),
            Arc::new(EnvConfigSource),
        )
    }

    /// Build with explicit clock and configuration source.
    pub fn with_deps(
        registry: TaskRegistry,
        config: PlatformConfig,
        clock: Arc<dyn Clock>,
        config_source: Arc<dyn ConfigSource>,
    ) -> Self {
        let metrics = Arc::new(MetricsRecorder::new(clock.clone()));
        let dead_letter = Arc::new(DeadLetterQueue::new(config.dead_letter_capacity));
        Self {
            base_registry: registry,
            config,
            config_source,
            clock,
            metrics,
            dead_letter,
            state: Mutex::new(PlatformState {
                phase: Phase::Idle,
                core: None,
            }),
        }
    }

    /// Apply the overlay, freeze the registry for this run, and start the
    /// worker pool and tickers.
    pub async fn start(&self) -> Result<(), StartupError> {
        let mut state = self.state_lock();
        if state.phase == Phase::Running {
            return Err(StartupError::AlreadyStarted);
        }

        let mut registry = self.base_registry.clone();
        registry.apply_overlay(self.config_source.as_ref())?;
        registry.finalize()?;
        let registry = Arc::new(registry);

        let ordered_types: HashSet<String> = registry
            .list()
            .into_iter()
            .filter(|d| d.preserve_order)
            .map(|d| d.job_type.clone())
            .collect();
        let queue = Arc::new(InvocationQueue::new(ordered_types));
        let governor = Arc::new(ConcurrencyGovernor::new(
            registry
                .list()
                .into_iter()
                .map(|d| (d.job_type.clone(), d.max_concurrent)),
            self.config.monitoring_dedup_mode,
            self.config.monitoring_types.clone(),
            self.metrics.clone(),
        ));
        for descriptor in registry.list() {
            self.metrics.register_type(&descriptor.job_type);
        }
        let enabled = Arc::new(EnabledFlags::from_registry(&registry));

        let executor = Arc::new(Executor::new(
            registry.clone(),
            queue.clone(),
            governor.clone(),
            self.metrics.clone(),
            self.dead_letter.clone(),
            self.clock.clone(),
            enabled.clone(),
            ExecutorConfig {
                workers: self.config.workers,
                ..ExecutorConfig::default()
            },
        ));
        let worker_handles = executor.clone().spawn_workers();

        let scheduler_shutdown = CancellationToken::new();
        let scheduler_handles = Scheduler::spawn(Arc::new(SchedulerContext {
            registry: registry.clone(),
            queue: queue.clone(),
            governor: governor.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            enabled: enabled.clone(),
            shutdown: scheduler_shutdown.clone(),
        }));

        info!(
            job_types = registry.len(),
            workers = self.config.workers,
            "job platform started"
        );

        state.phase = Phase::Running;
        state.core = Some(RunningCore {
            registry,
            queue,
            governor,
            executor,
            enabled,
            scheduler_shutdown,
            scheduler_handles,
            worker_handles,
            started_at: self.clock.now(),
        });
        Ok(())
    }

    /// Stop tickers, drain workers until the queue is empty or the graceful
    /// deadline passes, then cancel in-flight work; workers that still have
    /// not exited after a further hard threshold are aborted and their
    /// invocations recorded as cancelled.
    pub async fn stop(&self, graceful: Duration) {
        let core = {
            let mut state = self.state_lock();
            if state.phase != Phase::Running {
                debug!("stop called while not running");
                return;
            }
            state.phase = Phase::Stopped;
            state.core.take()
        };
        let Some(mut core) = core else { return };

        info!(
            graceful_ms = graceful.as_millis() as u64,
            "stopping job platform"
        );

        // Tickers stop before the executor drains.
        core.scheduler_shutdown.cancel();
        for handle in core.scheduler_handles.iter_mut() {
            let _ = handle.await;
        }

        core.queue.close();

        let drained = wait_for_workers(&mut core.worker_handles, graceful).await;
        if !drained {
            // Whatever is still queued will not run once workers are
            // cancelled; drop it now so the cancel window stays short.
            let dropped = core.queue.remove_matching(|_| true);
            if dropped > 0 {
                warn!(dropped, "dropped invocations still queued at the graceful deadline");
            }
            warn!("graceful deadline reached, cancelling in-flight work");
            core.executor.cancel_work();
            let exited = wait_for_workers(&mut core.worker_handles, HARD_KILL_GRACE).await;
            if !exited {
                warn!("hard kill threshold reached, aborting workers");
                for handle in &core.worker_handles {
                    handle.abort();
                }
                for handle in core.worker_handles.iter_mut() {
                    let _ = handle.await;
                }
                let abandoned = core.executor.abandon_running();
                if abandoned > 0 {
                    warn!(abandoned, "abandoned in-flight invocations");
                }
            }
        }

        // Stops any retry or not-before timers still pending.
        core.executor.cancel_work();

        // The stopped core stays around so health, metrics, and dead-letter
        // views remain inspectable after shutdown. A restart may already have
        // installed a fresh core; leave that one alone.
        {
            let mut state = self.state_lock();
            if state.phase == Phase::Stopped && state.core.is_none() {
                state.core = Some(core);
            }
        }
        info!("job platform stopped");
    }

    /// External producer path. Applies the same deduplication as scheduled
    /// pushes; returns the pending invocation's id on a dedup hit.
    ///
    /// Must be called from within a tokio runtime (delayed pushes spawn a
    /// timer task).
    pub fn enqueue(
        &self,
        job_type: &str,
        payload: Option<serde_json::Value>,
        options: EnqueueOptions,
    ) -> Result<Uuid, EnqueueError> {
        let (registry, queue, enabled, executor) = {
            let state = self.state_lock();
            match state.phase {
                Phase::Idle => return Err(EnqueueError::NotRunning),
                Phase::Stopped => return Err(EnqueueError::Shutdown),
                Phase::Running => {}
            }
            let Some(core) = state.core.as_ref() else {
                return Err(EnqueueError::NotRunning);
            };
            (
                core.registry.clone(),
                core.queue.clone(),
                core.enabled.clone(),
                core.executor.clone(),
            )
        };

        let Some(descriptor) = registry.get(job_type) else {
            return Err(EnqueueError::NotFound(job_type.to_string()));
        };
        if !enabled.is_enabled(job_type) {
            return Err(EnqueueError::Disabled(job_type.to_string()));
        }
        if let Some(payload) = &payload {
            let size = serde_json::to_vec(payload).map_or(0, |bytes| bytes.len());
            if size > self.config.max_payload_bytes {
                return Err(EnqueueError::PayloadTooLarge {
                    size,
                    limit: self.config.max_payload_bytes,
                });
            }
        }

        let now = self.clock.now();
        let priority = options.priority_override.unwrap_or(descriptor.priority);
        let invocation =
            Invocation::external(descriptor, now, priority, payload, options.dedup_key);
        let id = invocation.id;

        if let Some(not_before) = options.not_before {
            if not_before > now {
                let delay = (not_before - now).to_std().unwrap_or_default();
                debug!(
                    job_type = %job_type,
                    invocation_id = %id,
                    delay_ms = delay.as_millis() as u64,
                    "delaying enqueue"
                );
                executor.push_later(invocation, delay);
                return Ok(id);
            }
        }

        match queue.push(invocation) {
            PushOutcome::Enqueued(id) => Ok(id),
            PushOutcome::Duplicate(existing) => {
                debug!(
                    job_type = %job_type,
                    existing = %existing,
                    "enqueue collapsed into pending invocation"
                );
                self.metrics.record_dedup_drop(job_type);
                Ok(existing)
            }
            PushOutcome::Closed => Err(EnqueueError::Shutdown),
        }
    }

    /// Toggle a job type without re-registration.
    pub fn set_enabled(&self, job_type: &str, enabled: bool) -> Result<(), EnqueueError> {
        let state = self.state_lock();
        match state.phase {
            Phase::Idle => return Err(EnqueueError::NotRunning),
            Phase::Stopped => return Err(EnqueueError::Shutdown),
            Phase::Running => {}
        }
        let Some(core) = state.core.as_ref() else {
            return Err(EnqueueError::NotRunning);
        };
        if !core.enabled.set(job_type, enabled) {
            return Err(EnqueueError::NotFound(job_type.to_string()));
        }
        if !enabled {
            // Queued work for the type is stale the moment it is disabled;
            // workers additionally drop anything already in hand.
            let dropped = core
                .queue
                .remove_matching(|invocation| invocation.job_type == job_type);
            if dropped > 0 {
                info!(
                    job_type = %job_type,
                    dropped,
                    "dropped pending invocations for disabled type"
                );
            }
        }
        info!(job_type = %job_type, enabled, "job type toggled");
        Ok(())
    }

    /// Runtime override of the monitoring set used by stacking prevention.
    pub fn set_monitoring(&self, job_type: &str, monitoring: bool) -> Result<(), EnqueueError> {
        let state = self.state_lock();
        let Some(core) = state.core.as_ref() else {
            return Err(EnqueueError::NotRunning);
        };
        if core.registry.get(job_type).is_none() {
            return Err(EnqueueError::NotFound(job_type.to_string()));
        }
        core.governor.set_monitoring(job_type, monitoring);
        Ok(())
    }

    /// Per-type and aggregate health view.
    pub fn health(&self) -> HealthSnapshot {
        let state = self.state_lock();
        let running = state.phase == Phase::Running;
        let core = state.core.as_ref();
        let now = self.clock.now();

        let started_at = core.map(|c| c.started_at);
        let uptime_seconds = started_at
            .map(|s| (now - s).num_seconds().max(0) as u64)
            .unwrap_or(0);
        let (count, busy) = core
            .map(|c| (c.executor.worker_count(), c.executor.busy()))
            .unwrap_or((0, 0));

        let per_type: Vec<TypeHealth> = match core {
            Some(core) => core
                .registry
                .list()
                .into_iter()
                .map(|d| {
                    let stats = self.metrics.type_stats(&d.job_type);
                    TypeHealth {
                        job_type: d.job_type.clone(),
                        enabled: core.enabled.is_enabled(&d.job_type),
                        requires: d.requires.iter().cloned().collect(),
                        in_flight: core.governor.in_flight(&d.job_type),
                        pending: core.queue.len_by_type(&d.job_type),
                        last_success_at: stats.last_success_at,
                        last_failure_at: stats.last_failure_at,
                        last_error: stats.last_error,
                        success_rate_1h: stats.success_rate_1h,
                        avg_duration_ms: stats.avg_duration_ms,
                        interval_seconds: d.interval.as_secs(),
                        missed_ticks_1h: stats.missed_ticks_1h,
                        window_executions: stats.window_executions,
                    }
                })
                .collect(),
            None => self
                .base_registry
                .list()
                .into_iter()
                .map(|d| TypeHealth {
                    job_type: d.job_type.clone(),
                    enabled: d.enabled,
                    requires: d.requires.iter().cloned().collect(),
                    in_flight: 0,
                    pending: 0,
                    last_success_at: None,
                    last_failure_at: None,
                    last_error: None,
                    success_rate_1h: None,
                    avg_duration_ms: 0,
                    interval_seconds: d.interval.as_secs(),
                    missed_ticks_1h: 0,
                    window_executions: 0,
                })
                .collect(),
        };

        let dead_letter_depth = self.dead_letter.depth();
        let overall = derive_status(&HealthInputs {
            running,
            platform_bugs: self.metrics.platform_bug_count(),
            dead_letter_depth,
            dead_letter_unhealthy_threshold: self.config.dead_letter_unhealthy_threshold,
            per_type: &per_type,
        });

        HealthSnapshot {
            overall,
            started_at,
            uptime_seconds,
            workers: WorkerHealth {
                count,
                busy,
                idle: count.saturating_sub(busy),
            },
            dead_letter_depth,
            per_type,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Most recent execution records, newest last.
    pub fn recent_records(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.metrics.recent_records(limit)
    }

    pub fn dead_letter(&self) -> &DeadLetterQueue {
        &self.dead_letter
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        self.base_registry
            .list()
            .into_iter()
            .map(|d| d.job_type.clone())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.state_lock().phase == Phase::Running
    }

    fn state_lock(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Await every worker handle, bounded by `timeout`. Returns true when all
/// workers exited in time; finished handles are pruned either way.
async fn wait_for_workers(handles: &mut Vec<JoinHandle<()>>, timeout: Duration) -> bool {
    let all_exited = tokio::time::timeout(timeout, async {
        for handle in handles.iter_mut() {
            let _ = handle.await;
        }
    })
    .await
    .is_ok();

    if all_exited {
        handles.clear();
        true
    } else {
        handles.retain(|handle| !handle.is_finished());
        false
    }
}
