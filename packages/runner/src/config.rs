//! Platform-wide configuration loaded from a key-value source.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::ConfigOverrideInvalid;

/// Key-value configuration port.
///
/// Production hosts back this with the process environment; tests use
/// [`crate::testing::MapConfigSource`].
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Configuration source backed by process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// How aggressively stacking prevention treats monitoring job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitoringDedupMode {
    /// Skip ticks while any same-type work is pending or in flight, and drop
    /// popped invocations when a same-type execution has just begun.
    #[default]
    Strict,
    /// Tick-side prevention only; popped invocations always run.
    Conservative,
    /// Monitoring set is ignored; normal capacity rules apply.
    Off,
}

impl MonitoringDedupMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "conservative" => Some(Self::Conservative),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

/// Platform-wide settings.
///
/// Per-type settings live on descriptors and are adjusted by the registry's
/// environment overlay, not here.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Worker pool size.
    pub workers: usize,
    /// How long `stop` waits for in-flight work before cancelling it.
    pub graceful_shutdown: Duration,
    pub dead_letter_capacity: usize,
    pub monitoring_dedup_mode: MonitoringDedupMode,
    /// Extra job types treated as monitoring types, in addition to the
    /// `_monitor` suffix convention.
    pub monitoring_types: BTreeSet<String>,
    pub max_payload_bytes: usize,
    /// Dead-letter depth at which overall health reports unhealthy.
    pub dead_letter_unhealthy_threshold: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            graceful_shutdown: Duration::from_secs(30),
            dead_letter_capacity: 1000,
            monitoring_dedup_mode: MonitoringDedupMode::Strict,
            monitoring_types: BTreeSet::new(),
            max_payload_bytes: 262_144,
            dead_letter_unhealthy_threshold: 100,
        }
    }
}

impl PlatformConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigOverrideInvalid> {
        Self::from_source(&EnvConfigSource)
    }

    /// Load configuration from an arbitrary source, falling back to defaults
    /// for absent keys. Invalid values refuse to load.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigOverrideInvalid> {
        let mut config = Self::default();

        if let Some(value) = source.get("WORKERS") {
            config.workers = parse_int("WORKERS", &value, 1)? as usize;
        }
        if let Some(value) = source.get("GRACEFUL_SHUTDOWN_SECONDS") {
            config.graceful_shutdown =
                Duration::from_secs(parse_int("GRACEFUL_SHUTDOWN_SECONDS", &value, 0)?);
        }
        if let Some(value) = source.get("DEAD_LETTER_CAPACITY") {
            config.dead_letter_capacity = parse_int("DEAD_LETTER_CAPACITY", &value, 1)? as usize;
        }
        if let Some(value) = source.get("MONITORING_DEDUP_MODE") {
            config.monitoring_dedup_mode = MonitoringDedupMode::parse(&value).ok_or_else(|| {
                ConfigOverrideInvalid {
                    key: "MONITORING_DEDUP_MODE".into(),
                    value: value.clone(),
                    reason: "expected one of strict, conservative, off".into(),
                }
            })?;
        }
        if let Some(value) = source.get("MONITORING_TYPES") {
            config.monitoring_types = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = source.get("MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = parse_int("MAX_PAYLOAD_BYTES", &value, 1)? as usize;
        }
        if let Some(value) = source.get("DEAD_LETTER_UNHEALTHY_THRESHOLD") {
            config.dead_letter_unhealthy_threshold =
                parse_int("DEAD_LETTER_UNHEALTHY_THRESHOLD", &value, 1)? as usize;
        }

        Ok(config)
    }
}

fn parse_int(key: &str, value: &str, min: u64) -> Result<u64, ConfigOverrideInvalid> {
    match value.trim().parse::<u64>() {
        Ok(n) if n >= min => Ok(n),
        _ => Err(ConfigOverrideInvalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: format!("expected an integer >= {min}"),
        }),
    }
}
