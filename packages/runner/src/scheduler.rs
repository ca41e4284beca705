//! Wall-clock trigger source: one ticker per scheduled job type.
//!
//! Every tick re-checks the runtime enabled flag, applies stacking
//! prevention against the queue and governor, and only then constructs a
//! scheduled invocation. Ticks are never queued behind a still-pending
//! identical invocation.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::Clock;
use crate::descriptor::TaskDescriptor;
use crate::governor::ConcurrencyGovernor;
use crate::invocation::Invocation;
use crate::metrics::MetricsRecorder;
use crate::platform::EnabledFlags;
use crate::queue::{InvocationQueue, PushOutcome};
use crate::registry::TaskRegistry;

/// Shared state handed to every ticker.
pub(crate) struct SchedulerContext {
    pub registry: Arc<TaskRegistry>,
    pub queue: Arc<InvocationQueue>,
    pub governor: Arc<ConcurrencyGovernor>,
    pub metrics: Arc<MetricsRecorder>,
    pub clock: Arc<dyn Clock>,
    pub enabled: Arc<EnabledFlags>,
    pub shutdown: CancellationToken,
}

pub(crate) struct Scheduler;

impl Scheduler {
    /// Spawn one ticker per job type with a positive interval.
    ///
    /// Disabled types still get a ticker; the flag is re-checked every tick
    /// so `set_enabled` takes effect without a restart.
    pub fn spawn(ctx: Arc<SchedulerContext>) -> Vec<JoinHandle<()>> {
        ctx.registry
            .list()
            .into_iter()
            .filter(|descriptor| descriptor.is_scheduled())
            .map(|descriptor| {
                let ctx = ctx.clone();
                let descriptor = descriptor.clone();
                tokio::spawn(async move { Self::run_ticker(ctx, descriptor).await })
            })
            .collect()
    }

    async fn run_ticker(ctx: Arc<SchedulerContext>, descriptor: TaskDescriptor) {
        debug!(
            job_type = %descriptor.job_type,
            interval_ms = descriptor.interval.as_millis() as u64,
            "ticker started"
        );
        loop {
            if ctx.shutdown.is_cancelled() {
                break;
            }
            Self::tick(&ctx, &descriptor);
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = ctx.clock.sleep(descriptor.interval) => {}
            }
        }
        debug!(job_type = %descriptor.job_type, "ticker stopped");
    }

    fn tick(ctx: &SchedulerContext, descriptor: &TaskDescriptor) {
        let job_type = descriptor.job_type.as_str();
        if !ctx.enabled.is_enabled(job_type) {
            return;
        }

        let pending = ctx.queue.len_by_type(job_type);
        let in_flight = ctx.governor.in_flight(job_type) as usize;
        // Monitoring types tolerate no concurrent or pending work at all;
        // everything else is bounded by its own capacity.
        let blocked = if ctx.governor.is_monitoring(job_type) {
            in_flight + pending >= 1
        } else {
            in_flight + pending >= descriptor.max_concurrent as usize
        };

        if blocked {
            debug!(
                job_type = %job_type,
                pending,
                in_flight,
                "tick skipped by stacking prevention"
            );
            ctx.metrics.record_scheduler_skip(job_type);
            return;
        }

        let invocation = Invocation::scheduled(descriptor, ctx.clock.now());
        match ctx.queue.push(invocation) {
            PushOutcome::Enqueued(id) => {
                debug!(job_type = %job_type, invocation_id = %id, "tick enqueued");
            }
            PushOutcome::Duplicate(_) => {
                // Lost the race against another producer of the same key.
                ctx.metrics.record_scheduler_skip(job_type);
            }
            PushOutcome::Closed => {}
        }
    }
}
