//! Per-type concurrency bookkeeping.
//!
//! One capacity counter per job type; workers attempt acquisition only at
//! dequeue time and never block on it, so the short internal mutex is never
//! held across an await.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::error;

use crate::config::MonitoringDedupMode;
use crate::metrics::MetricsRecorder;

struct GovernorInner {
    capacity: HashMap<String, u32>,
    in_flight: HashMap<String, u32>,
    monitoring: BTreeSet<String>,
    not_monitoring: BTreeSet<String>,
}

/// Capacity semaphores and the monitoring set used by stacking prevention.
pub struct ConcurrencyGovernor {
    inner: Mutex<GovernorInner>,
    mode: MonitoringDedupMode,
    metrics: Arc<MetricsRecorder>,
}

impl ConcurrencyGovernor {
    /// `capacities` comes from the frozen registry; `monitoring` is the
    /// explicitly configured monitoring set (the `_monitor` name suffix is
    /// always honored on top of it).
    pub fn new(
        capacities: impl IntoIterator<Item = (String, u32)>,
        mode: MonitoringDedupMode,
        monitoring: BTreeSet<String>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let capacity: HashMap<String, u32> = capacities.into_iter().collect();
        let in_flight = capacity.keys().map(|ty| (ty.clone(), 0)).collect();
        Self {
            inner: Mutex::new(GovernorInner {
                capacity,
                in_flight,
                monitoring,
                not_monitoring: BTreeSet::new(),
            }),
            mode,
            metrics,
        }
    }

    /// Try to claim an execution slot. Non-blocking; `false` means the type
    /// is at capacity (or unknown, which is a platform bug).
    pub fn try_acquire(&self, job_type: &str) -> bool {
        let mut inner = self.lock();
        let Some(capacity) = inner.capacity.get(job_type).copied() else {
            error!(critical = true, job_type, "acquire for unregistered job type");
            self.metrics.record_platform_bug();
            return false;
        };
        let current = inner.in_flight.entry(job_type.to_string()).or_insert(0);
        if *current >= capacity {
            return false;
        }
        *current += 1;
        true
    }

    /// Release a slot claimed with `try_acquire`.
    pub fn release(&self, job_type: &str) {
        let mut inner = self.lock();
        match inner.in_flight.get_mut(job_type) {
            Some(current) if *current > 0 => *current -= 1,
            _ => {
                error!(critical = true, job_type, "release without matching acquire");
                self.metrics.record_platform_bug();
            }
        }
    }

    pub fn in_flight(&self, job_type: &str) -> u32 {
        self.lock().in_flight.get(job_type).copied().unwrap_or(0)
    }

    pub fn in_flight_all(&self) -> HashMap<String, u32> {
        self.lock().in_flight.clone()
    }

    /// Whether stacking prevention should treat this type aggressively.
    pub fn is_monitoring(&self, job_type: &str) -> bool {
        if self.mode == MonitoringDedupMode::Off {
            return false;
        }
        let inner = self.lock();
        if inner.not_monitoring.contains(job_type) {
            return false;
        }
        job_type.ends_with("_monitor") || inner.monitoring.contains(job_type)
    }

    /// Runtime override of the monitoring set.
    pub fn set_monitoring(&self, job_type: &str, monitoring: bool) {
        let mut inner = self.lock();
        if monitoring {
            inner.not_monitoring.remove(job_type);
            inner.monitoring.insert(job_type.to_string());
        } else {
            inner.monitoring.remove(job_type);
            inner.not_monitoring.insert(job_type.to_string());
        }
    }

    pub fn mode(&self) -> MonitoringDedupMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, GovernorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
