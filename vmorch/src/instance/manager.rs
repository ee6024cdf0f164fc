//! Thread-safe registry of the runtime's instances.
//!
//! Config (immutable) and state (mutable) are kept apart. Registration and
//! removal write to the audit store before touching the cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use vmorch_shared::errors::{VmorchError, VmorchResult};

use super::config::InstanceConfig;
use super::InstanceResources;
use crate::db::{AuditStore, InstanceRecord};
use crate::lifecycle::SharedState;
use crate::runtime::types::{InstanceId, InstanceInfo};
use crate::vmm::ControlSurface;

/// Everything a handle needs to drive one instance.
///
/// Cloning shares the state and the owned host resources.
#[derive(Clone)]
pub(crate) struct InstanceSlot {
    pub config: Arc<InstanceConfig>,
    pub state: SharedState,
    pub resources: Arc<tokio::sync::Mutex<InstanceResources>>,
    pub surface: Arc<dyn ControlSurface>,
}

impl InstanceSlot {
    pub fn new(config: InstanceConfig, state: SharedState, surface: Arc<dyn ControlSurface>) -> Self {
        Self {
            config: Arc::new(config),
            state,
            resources: Arc::new(tokio::sync::Mutex::new(InstanceResources::default())),
            surface,
        }
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo::new(&self.config, &self.state.lock())
    }
}

#[derive(Clone)]
pub(crate) struct InstanceManager {
    inner: Arc<RwLock<InstanceManagerInner>>,
}

struct InstanceManagerInner {
    instances: HashMap<InstanceId, InstanceSlot>,
    store: AuditStore,
}

impl std::fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceManager").finish()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> VmorchError {
    VmorchError::Internal(format!("instance manager lock poisoned: {}", e))
}

impl InstanceManager {
    pub fn new(store: AuditStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(InstanceManagerInner {
                instances: HashMap::new(),
                store,
            })),
        }
    }

    /// Register a new instance. Database-first.
    pub fn register(&self, slot: InstanceSlot) -> VmorchResult<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;

        if inner.instances.contains_key(&slot.config.id) {
            return Err(VmorchError::Internal(format!(
                "instance {} already registered",
                slot.config.id
            )));
        }

        let record = slot.config.to_record(&slot.state.lock());
        inner.store.insert(&record)?;

        tracing::debug!(
            instance_id = %slot.config.id,
            name = ?slot.config.name,
            "Registering instance"
        );

        inner.instances.insert(slot.config.id.clone(), slot);
        Ok(())
    }

    /// Register an instance loaded from the audit store.
    pub fn register_recovered(&self, slot: InstanceSlot) -> VmorchResult<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;

        if inner.instances.contains_key(&slot.config.id) {
            return Err(VmorchError::Internal(format!(
                "instance {} already registered",
                slot.config.id
            )));
        }

        tracing::debug!(instance_id = %slot.config.id, "Registering recovered instance");
        inner.instances.insert(slot.config.id.clone(), slot);
        Ok(())
    }

    pub fn get(&self, id: &str) -> VmorchResult<Option<InstanceSlot>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.instances.get(id).cloned())
    }

    pub fn get_by_name(&self, name: &str) -> VmorchResult<Option<InstanceSlot>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .instances
            .values()
            .find(|slot| slot.config.name.as_deref() == Some(name))
            .cloned())
    }

    /// Summaries of every instance, newest first.
    pub fn list(&self) -> VmorchResult<Vec<InstanceInfo>> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut infos: Vec<InstanceInfo> = inner.instances.values().map(InstanceSlot::info).collect();
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(infos)
    }

    /// Write the current state of `id` to the audit store.
    pub fn save_state(&self, id: &str) -> VmorchResult<()> {
        let inner = self.inner.read().map_err(poisoned)?;
        let slot = inner
            .instances
            .get(id)
            .ok_or_else(|| VmorchError::NotFound(format!("instance {}", id)))?;

        // Snapshot first so the state lock is not held during I/O.
        let snapshot = slot.state.lock().clone();
        inner.store.save_state(id, &snapshot)
    }

    /// Remove an instance. Database-first.
    pub fn remove(&self, id: &str) -> VmorchResult<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;

        if !inner.instances.contains_key(id) {
            return Err(VmorchError::NotFound(format!("instance {}", id)));
        }

        inner.store.delete(id)?;
        inner.instances.remove(id);

        tracing::debug!(instance_id = %id, "Removed instance from manager");
        Ok(())
    }

    pub fn load_all_persisted(&self) -> VmorchResult<Vec<InstanceRecord>> {
        let inner = self.inner.read().map_err(poisoned)?;
        inner.store.list()
    }

    pub fn store(&self) -> VmorchResult<AuditStore> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.store.clone())
    }
}
