//! Health snapshot exposed to hosts (HTTP health endpoints and operators).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate platform status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub count: usize,
    pub busy: usize,
    pub idle: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeHealth {
    pub job_type: String,
    pub enabled: bool,
    /// Advisory capability tags from the descriptor.
    pub requires: Vec<String>,
    pub in_flight: u32,
    pub pending: usize,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_rate_1h: Option<f64>,
    pub avg_duration_ms: u64,
    pub interval_seconds: u64,
    pub missed_ticks_1h: u64,
    /// Executions inside the rolling window; feeds the sustained-failure rule
    /// but is not part of the serialized shape.
    #[serde(skip)]
    pub(crate) window_executions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub overall: HealthStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub workers: WorkerHealth,
    pub dead_letter_depth: usize,
    pub per_type: Vec<TypeHealth>,
}

impl HealthSnapshot {
    pub fn for_type(&self, job_type: &str) -> Option<&TypeHealth> {
        self.per_type.iter().find(|t| t.job_type == job_type)
    }
}

/// Inputs for the overall-status derivation, gathered by the platform.
pub(crate) struct HealthInputs<'a> {
    pub running: bool,
    pub platform_bugs: u64,
    pub dead_letter_depth: usize,
    pub dead_letter_unhealthy_threshold: usize,
    pub per_type: &'a [TypeHealth],
}

/// Derive the aggregate status.
///
/// Unhealthy: not running, an internal invariant was violated, the dead-letter
/// queue passed its threshold, or any type shows sustained failure (success
/// rate under 0.5 with at least 5 executions in the window). Degraded: recent
/// failures or any dead-lettered jobs, short of the above.
pub(crate) fn derive_status(inputs: &HealthInputs<'_>) -> HealthStatus {
    if !inputs.running || inputs.platform_bugs > 0 {
        return HealthStatus::Unhealthy;
    }
    if inputs.dead_letter_depth >= inputs.dead_letter_unhealthy_threshold {
        return HealthStatus::Unhealthy;
    }

    let mut degraded = inputs.dead_letter_depth > 0;
    for t in inputs.per_type {
        if let Some(rate) = t.success_rate_1h {
            if rate < 0.5 && t.window_executions >= 5 {
                return HealthStatus::Unhealthy;
            }
            if rate < 1.0 {
                degraded = true;
            }
        }
    }

    if degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
