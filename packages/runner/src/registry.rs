//! Task registry: the authoritative mapping from job type to descriptor.
//!
//! Built in a single discovery pass at startup. Each task module contributes
//! one descriptor through its registration function; the platform applies the
//! environment overlay and freezes the registry before the first tick.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::config::ConfigSource;
use crate::descriptor::TaskDescriptor;
use crate::error::{ConfigOverrideInvalid, RegistryError};

/// Mapping `job_type -> descriptor`, frozen after discovery.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    entries: BTreeMap<String, TaskDescriptor>,
    frozen: bool,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor.
    ///
    /// `preserve_order` types are normalized to capacity 1. Dependency
    /// references are validated later, at [`TaskRegistry::finalize`], so that
    /// registration order within a discovery pass does not matter.
    pub fn register(&mut self, descriptor: TaskDescriptor) -> Result<(), RegistryError> {
        if self.frozen {
            return Err(RegistryError::RegistryFrozen);
        }
        if descriptor.job_type.trim().is_empty() {
            return Err(RegistryError::InvalidDescriptor {
                job_type: descriptor.job_type.clone(),
                reason: "job_type must not be empty".into(),
            });
        }
        if descriptor.max_concurrent < 1 {
            return Err(RegistryError::InvalidDescriptor {
                job_type: descriptor.job_type.clone(),
                reason: "max_concurrent must be at least 1".into(),
            });
        }
        if self.entries.contains_key(&descriptor.job_type) {
            return Err(RegistryError::DuplicateJobType(descriptor.job_type.clone()));
        }

        let mut descriptor = descriptor;
        if descriptor.preserve_order && descriptor.max_concurrent != 1 {
            debug!(
                job_type = %descriptor.job_type,
                "preserve_order forces max_concurrent to 1"
            );
            descriptor.max_concurrent = 1;
        }

        self.entries
            .insert(descriptor.job_type.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<&TaskDescriptor> {
        self.entries.get(job_type)
    }

    /// Snapshot of all descriptors, sorted by job type.
    pub fn list(&self) -> Vec<&TaskDescriptor> {
        self.entries.values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Apply the environment overlay to every descriptor.
    ///
    /// For each job type, `<JOB_TYPE>_ENABLED` and
    /// `<JOB_TYPE>_INTERVAL_SECONDS` (with `<JOB_TYPE>_RUNNER_*` accepted as
    /// aliases) override the registered values. Invalid values reject the
    /// whole overlay and the platform refuses to start.
    pub fn apply_overlay(&mut self, source: &dyn ConfigSource) -> Result<(), RegistryError> {
        if self.frozen {
            return Err(RegistryError::RegistryFrozen);
        }

        for descriptor in self.entries.values_mut() {
            let prefix = env_prefix(&descriptor.job_type);

            if let Some((key, value)) = lookup(source, &prefix, "ENABLED") {
                descriptor.enabled = parse_bool(&key, &value)?;
                debug!(job_type = %descriptor.job_type, enabled = descriptor.enabled, "overlay applied");
            }
            if let Some((key, value)) = lookup(source, &prefix, "INTERVAL_SECONDS") {
                descriptor.interval = Duration::from_secs(parse_interval(&key, &value)?);
                debug!(
                    job_type = %descriptor.job_type,
                    interval_seconds = descriptor.interval.as_secs(),
                    "overlay applied"
                );
            }
        }

        Ok(())
    }

    /// Validate cross-type references and freeze the registry.
    ///
    /// After this call every `register` and `apply_overlay` fails with
    /// `RegistryFrozen`; concurrent readers need no locking.
    pub fn finalize(&mut self) -> Result<(), RegistryError> {
        if self.frozen {
            return Err(RegistryError::RegistryFrozen);
        }

        for descriptor in self.entries.values() {
            for dependency in &descriptor.dependencies {
                if !self.entries.contains_key(dependency) {
                    return Err(RegistryError::UnknownDependency {
                        job_type: descriptor.job_type.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        self.frozen = true;
        Ok(())
    }
}

/// Conventional environment prefix for a job type: upper-cased with
/// non-alphanumerics mapped to underscores.
fn env_prefix(job_type: &str) -> String {
    job_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Look up `<PREFIX>_<SUFFIX>`, falling back to the `<PREFIX>_RUNNER_<SUFFIX>`
/// alias. The non-alias key wins when both are present.
fn lookup(source: &dyn ConfigSource, prefix: &str, suffix: &str) -> Option<(String, String)> {
    let key = format!("{prefix}_{suffix}");
    if let Some(value) = source.get(&key) {
        return Some((key, value));
    }
    let alias = format!("{prefix}_RUNNER_{suffix}");
    source.get(&alias).map(|value| (alias, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigOverrideInvalid> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigOverrideInvalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".into(),
        }),
    }
}

fn parse_interval(key: &str, value: &str) -> Result<u64, ConfigOverrideInvalid> {
    match value.trim().parse::<u64>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(ConfigOverrideInvalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a positive integer of seconds".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;
    use crate::testing::{MapConfigSource, MockTask};

    fn descriptor(job_type: &str) -> TaskDescriptor {
        TaskDescriptor::builder()
            .job_type(job_type)
            .display_name(job_type)
            .task(Arc::new(MockTask::new()))
            .build()
    }

    #[test]
    fn register_and_get() {
        let mut registry = TaskRegistry::new();
        registry.register(descriptor("alpha")).unwrap();

        assert!(registry.get("alpha").is_some());
        assert!(registry.get("beta").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register(descriptor("alpha")).unwrap();

        let err = registry.register(descriptor("alpha")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateJobType(t) if t == "alpha"));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut registry = TaskRegistry::new();
        let d = TaskDescriptor::builder()
            .job_type("alpha")
            .display_name("Alpha")
            .max_concurrent(0)
            .task(Arc::new(MockTask::new()))
            .build();

        assert!(matches!(
            registry.register(d),
            Err(RegistryError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn preserve_order_forces_capacity_one() {
        let mut registry = TaskRegistry::new();
        let d = TaskDescriptor::builder()
            .job_type("ordered")
            .display_name("Ordered")
            .preserve_order(true)
            .max_concurrent(4)
            .task(Arc::new(MockTask::new()))
            .build();

        registry.register(d).unwrap();
        assert_eq!(registry.get("ordered").unwrap().max_concurrent, 1);
    }

    #[test]
    fn list_is_sorted_by_job_type() {
        let mut registry = TaskRegistry::new();
        registry.register(descriptor("zeta")).unwrap();
        registry.register(descriptor("alpha")).unwrap();
        registry.register(descriptor("mid")).unwrap();

        let types: Vec<&str> = registry.list().iter().map(|d| d.job_type.as_str()).collect();
        assert_eq!(types, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn finalize_validates_dependencies() {
        let mut registry = TaskRegistry::new();
        let mut deps = BTreeSet::new();
        deps.insert("missing".to_string());
        let d = TaskDescriptor::builder()
            .job_type("alpha")
            .display_name("Alpha")
            .dependencies(deps)
            .task(Arc::new(MockTask::new()))
            .build();
        registry.register(d).unwrap();

        let err = registry.finalize().unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDependency { .. }));
    }

    #[test]
    fn dependencies_within_same_pass_are_accepted() {
        let mut registry = TaskRegistry::new();
        let mut deps = BTreeSet::new();
        deps.insert("beta".to_string());
        let d = TaskDescriptor::builder()
            .job_type("alpha")
            .display_name("Alpha")
            .dependencies(deps)
            .task(Arc::new(MockTask::new()))
            .build();
        // Dependent registered before its dependency: order must not matter.
        registry.register(d).unwrap();
        registry.register(descriptor("beta")).unwrap();

        registry.finalize().unwrap();
        assert!(registry.is_frozen());
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let mut registry = TaskRegistry::new();
        registry.register(descriptor("alpha")).unwrap();
        registry.finalize().unwrap();

        assert!(matches!(
            registry.register(descriptor("beta")),
            Err(RegistryError::RegistryFrozen)
        ));
    }

    #[test]
    fn overlay_overrides_enabled_and_interval() {
        let mut registry = TaskRegistry::new();
        registry.register(descriptor("chain_sync")).unwrap();

        let source = MapConfigSource::from_pairs([
            ("CHAIN_SYNC_ENABLED", "false"),
            ("CHAIN_SYNC_INTERVAL_SECONDS", "120"),
        ]);
        registry.apply_overlay(&source).unwrap();

        let d = registry.get("chain_sync").unwrap();
        assert!(!d.enabled);
        assert_eq!(d.interval, Duration::from_secs(120));
    }

    #[test]
    fn overlay_accepts_runner_alias() {
        let mut registry = TaskRegistry::new();
        registry.register(descriptor("chain_sync")).unwrap();

        let source = MapConfigSource::from_pairs([("CHAIN_SYNC_RUNNER_ENABLED", "false")]);
        registry.apply_overlay(&source).unwrap();
        assert!(!registry.get("chain_sync").unwrap().enabled);
    }

    #[test]
    fn overlay_prefers_primary_key_over_alias() {
        let mut registry = TaskRegistry::new();
        registry.register(descriptor("chain_sync")).unwrap();

        let source = MapConfigSource::from_pairs([
            ("CHAIN_SYNC_ENABLED", "true"),
            ("CHAIN_SYNC_RUNNER_ENABLED", "false"),
        ]);
        registry.apply_overlay(&source).unwrap();
        assert!(registry.get("chain_sync").unwrap().enabled);
    }

    #[test]
    fn overlay_rejects_invalid_values() {
        let mut registry = TaskRegistry::new();
        registry.register(descriptor("chain_sync")).unwrap();

        let source = MapConfigSource::from_pairs([("CHAIN_SYNC_INTERVAL_SECONDS", "soon")]);
        let err = registry.apply_overlay(&source).unwrap_err();
        assert!(matches!(err, RegistryError::ConfigOverrideInvalid(_)));

        let source = MapConfigSource::from_pairs([("CHAIN_SYNC_INTERVAL_SECONDS", "0")]);
        assert!(registry.apply_overlay(&source).is_err());
    }

    #[test]
    fn env_prefix_upcases_and_replaces_punctuation() {
        assert_eq!(env_prefix("chain_sync"), "CHAIN_SYNC");
        assert_eq!(env_prefix("dao.proposal-vote"), "DAO_PROPOSAL_VOTE");
    }
}
