#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use runner_core::testing::MapConfigSource;
use runner_core::{JobPlatform, PlatformConfig, SystemClock, TaskDescriptor, TaskRegistry};

/// Small pool and short graceful window keep the suites fast.
pub fn test_config() -> PlatformConfig {
    PlatformConfig {
        workers: 2,
        graceful_shutdown: Duration::from_secs(1),
        ..PlatformConfig::default()
    }
}

pub fn platform(descriptors: Vec<TaskDescriptor>) -> JobPlatform {
    platform_with_config(descriptors, test_config())
}

pub fn platform_with_config(
    descriptors: Vec<TaskDescriptor>,
    config: PlatformConfig,
) -> JobPlatform {
    platform_with_source(descriptors, config, MapConfigSource::new())
}

/// Builds the platform over an isolated config source so ambient environment
/// variables cannot leak into the overlay.
pub fn platform_with_source(
    descriptors: Vec<TaskDescriptor>,
    config: PlatformConfig,
    source: MapConfigSource,
) -> JobPlatform {
    let mut registry = TaskRegistry::new();
    for descriptor in descriptors {
        registry.register(descriptor).expect("descriptor registers");
    }
    JobPlatform::with_deps(registry, config, Arc::new(SystemClock), Arc::new(source))
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
