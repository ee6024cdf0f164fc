//! Instance - one VM lifecycle under the runtime.
//!
//! - `launch`: validation, network bring-up, configuration and start
//! - `control`: stop, crash handling and post-boot device updates
//! - `manager`: registry with audit persistence

pub(crate) mod config;
mod control;
mod launch;
mod manager;

pub use config::InstanceConfig;
pub use control::StopReport;
pub(crate) use manager::{InstanceManager, InstanceSlot};

use std::sync::Arc;
use std::sync::atomic::Ordering;

use vmorch_shared::Transport;
use vmorch_shared::errors::{VmorchError, VmorchResult};
use vmorch_shared::lifecycle::{InstancePhase, LifecycleEvent};

use crate::lifecycle::InstanceState;
use crate::net::{TapAddress, TapLease};
use crate::runtime::rt_impl::RuntimeInner;
use crate::runtime::types::{InstanceId, InstanceInfo};
use crate::sequencer::{Sequencer, SequencerCtx};
use crate::spec::InstanceSpec;
use crate::vmm::{ControlClient, VmmProcess};

/// Host resources held while an instance is up.
///
/// The surrounding async mutex also serializes the operations of one
/// instance.
#[derive(Default)]
pub(crate) struct InstanceResources {
    leases: Vec<TapLease>,
    vmm: Option<VmmProcess>,
}

/// Handle to one instance.
///
/// Cheap to clone; every clone drives the same instance.
#[derive(Clone)]
pub struct Instance {
    runtime: RuntimeInner,
    slot: InstanceSlot,
    sequencer: Sequencer,
}

impl Instance {
    pub(crate) fn new(runtime: RuntimeInner, slot: InstanceSlot) -> Self {
        let client = ControlClient::new(
            Arc::clone(&slot.surface),
            runtime.options.request_timeout(),
        );
        let sequencer = Sequencer::new(SequencerCtx {
            instance_id: slot.config.id.clone(),
            client,
            state: Arc::clone(&slot.state),
        });

        Self {
            runtime,
            slot,
            sequencer,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.slot.config.id
    }

    pub fn name(&self) -> Option<&str> {
        self.slot.config.name.as_deref()
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.slot.config
    }

    pub fn spec(&self) -> &InstanceSpec {
        &self.slot.config.spec
    }

    pub fn transport(&self) -> &Transport {
        &self.slot.config.transport
    }

    pub fn phase(&self) -> InstancePhase {
        self.slot.state.lock().phase()
    }

    /// Snapshot of phase, step log and last error.
    pub fn state(&self) -> InstanceState {
        self.slot.state.lock().clone()
    }

    pub fn info(&self) -> InstanceInfo {
        self.slot.info()
    }

    /// Leased tap devices and their addresses, in acquisition order.
    pub async fn network(&self) -> Vec<(String, TapAddress)> {
        let resources = self.slot.resources.lock().await;
        resources
            .leases
            .iter()
            .map(|lease| (lease.dev().to_string(), *lease.address()))
            .collect()
    }

    /// PID of the VMM process launched for this instance.
    pub async fn vmm_pid(&self) -> Option<u32> {
        let resources = self.slot.resources.lock().await;
        resources.vmm.as_ref().and_then(VmmProcess::pid)
    }

    /// Apply `event` and persist the new phase.
    fn transition(&self, event: LifecycleEvent) -> VmorchResult<InstancePhase> {
        let phase = self.slot.state.lock().apply_event(event)?;
        self.persist()?;
        Ok(phase)
    }

    fn persist(&self) -> VmorchResult<()> {
        self.runtime.manager.save_state(self.id())
    }

    fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!(instance_id = %self.id(), error = %e, "Failed to persist instance state");
        }
    }

    /// Move to `Failed` with `cause`, persist and count the failure once.
    fn mark_failed(&self, cause: &VmorchError) {
        let was_terminal = {
            let mut state = self.slot.state.lock();
            let was_terminal = state.phase().is_terminal();
            state.fail(cause);
            was_terminal
        };
        self.persist_or_warn();

        if !was_terminal {
            self.runtime
                .runtime_metrics
                .instances_failed
                .fetch_add(1, Ordering::Relaxed);
        }
        tracing::warn!(instance_id = %self.id(), error = %cause, "Instance failed");
    }

    /// Append tap release failures to the recorded error and persist.
    fn note_release_errors(&self, errors: &[String]) {
        if errors.is_empty() {
            return;
        }
        self.slot
            .state
            .lock()
            .append_error(format!("network release failed: {}", errors.join("; ")));
        self.persist_or_warn();
    }

    /// Release leases newest first. Returns the errors, already logged.
    async fn release_leases(&self, leases: Vec<TapLease>) -> Vec<String> {
        let mut errors = Vec::new();
        for lease in leases.into_iter().rev() {
            let dev = lease.dev().to_string();
            if let Err(e) = lease.release().await {
                tracing::warn!(
                    instance_id = %self.id(),
                    dev = %dev,
                    error = %e,
                    "Failed to release tap device"
                );
                errors.push(format!("{}: {}", dev, e));
            }
        }
        errors
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", self.id())
            .field("name", &self.name())
            .field("phase", &self.phase())
            .finish()
    }
}

// Compile-time assertion that Instance is Send + Sync.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Instance>();
};
