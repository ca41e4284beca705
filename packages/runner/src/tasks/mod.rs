//! The discoverable tasks area.
//!
//! Each task module owns one job type: its descriptor (registration metadata)
//! and its implementation. `register_builtin` is the explicit discovery list;
//! the host calls it once at startup, before handing the registry to the
//! platform.

use std::sync::Arc;

use crate::error::RegistryError;
use crate::registry::TaskRegistry;
use crate::store::QueueStore;

pub mod message_dispatch;
pub mod queue_monitor;

/// Services available to every bundled task.
pub struct TaskDeps {
    pub queue_store: Arc<dyn QueueStore>,
}

/// Discovery pass: register every bundled task.
pub fn register_builtin(
    registry: &mut TaskRegistry,
    deps: Arc<TaskDeps>,
) -> Result<(), RegistryError> {
    registry.register(message_dispatch::descriptor(deps.clone()))?;
    registry.register(queue_monitor::descriptor(deps))?;
    Ok(())
}
