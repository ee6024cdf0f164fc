//! Launch: validate, bring up networking, configure and start.
//!
//! ```text
//! validate → BeginConfigure → acquire taps → spawn VMM? → apply steps
//!          → ConfigurationComplete → start action → Start
//! ```
//!
//! Every exit other than success releases the leases acquired so far and
//! leaves the instance `Failed` with the cause recorded.

use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;
use vmorch_shared::errors::{VmorchError, VmorchResult};
use vmorch_shared::lifecycle::{InstancePhase, LifecycleEvent};

use super::Instance;
use crate::net::TapLease;
use crate::vmm::VmmProcess;

impl Instance {
    /// Launch the instance and wait until it is `Running`.
    pub async fn launch(&self) -> VmorchResult<()> {
        self.launch_with_cancel(CancellationToken::new()).await
    }

    /// Like [`Instance::launch`], aborted when `cancel` fires.
    ///
    /// A cancelled launch releases its leases, leaves the instance `Failed`
    /// and returns [`VmorchError::Cancelled`]. Dropping the returned future
    /// has the same effect, with lease teardown scheduled in the background.
    pub async fn launch_with_cancel(&self, cancel: CancellationToken) -> VmorchResult<()> {
        let mut resources = self.slot.resources.lock().await;

        let phase = self.phase();
        if phase != InstancePhase::Unconfigured {
            return Err(VmorchError::InvalidTransition {
                from: phase,
                attempted: LifecycleEvent::BeginConfigure,
            });
        }

        if let Err(e) = self.runtime.validator.validate(self.spec()) {
            self.mark_failed(&e);
            return Err(e);
        }

        self.transition(LifecycleEvent::BeginConfigure)?;
        tracing::info!(instance_id = %self.id(), "Launching instance");

        let mut guard = LaunchGuard::new(self.clone());
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VmorchError::Cancelled),
            result = self.bring_up(&mut guard) => result,
        };

        match outcome {
            Ok(()) => {
                let (leases, vmm) = guard.disarm();
                resources.leases = leases;
                resources.vmm = vmm;

                self.runtime
                    .runtime_metrics
                    .instances_started
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!(instance_id = %self.id(), "Instance running");
                Ok(())
            }
            Err(e) => Err(guard.abort(e).await),
        }
    }

    async fn bring_up(&self, guard: &mut LaunchGuard) -> VmorchResult<()> {
        let spec = self.spec();

        for dev in spec.host_devices() {
            let lease = self
                .runtime
                .network
                .acquire(dev)
                .await
                .inspect_err(|e| log_launch_error(self.id(), "network", e))?;
            tracing::debug!(
                instance_id = %self.id(),
                dev = %dev,
                address = %lease.address(),
                "Tap device leased"
            );
            guard.leases.push(lease);
        }

        if let Some(launch) = self.runtime.vmm_launch(self.config()) {
            let vmm = VmmProcess::spawn(&launch)
                .await
                .inspect_err(|e| log_launch_error(self.id(), "vmm-spawn", e))?;
            tracing::info!(instance_id = %self.id(), pid = ?vmm.pid(), "VMM process started");
            guard.vmm = Some(vmm);
        }

        let metrics = self.sequencer.apply(spec).await?;
        self.transition(LifecycleEvent::ConfigurationComplete)?;
        tracing::debug!(
            instance_id = %self.id(),
            steps = metrics.task_names().len(),
            duration_ms = metrics.total_duration_ms,
            "Instance ready"
        );

        self.sequencer.start().await?;
        self.transition(LifecycleEvent::Start)?;
        Ok(())
    }
}

fn log_launch_error(instance_id: &str, stage: &str, error: &VmorchError) {
    tracing::error!(instance_id, stage, error = %error, "Launch stage failed");
}

/// Resources acquired by a launch that has not finished yet.
///
/// Dropped while armed (the launch future was dropped), it lets every lease
/// schedule its own teardown, kills the VMM and marks the instance failed.
struct LaunchGuard {
    instance: Instance,
    leases: Vec<TapLease>,
    vmm: Option<VmmProcess>,
    armed: bool,
}

impl LaunchGuard {
    fn new(instance: Instance) -> Self {
        Self {
            instance,
            leases: Vec::new(),
            vmm: None,
            armed: true,
        }
    }

    /// Hand the resources over to the running instance.
    fn disarm(mut self) -> (Vec<TapLease>, Option<VmmProcess>) {
        self.armed = false;
        (std::mem::take(&mut self.leases), self.vmm.take())
    }

    /// Release everything and fail the instance with `cause`.
    async fn abort(mut self, cause: VmorchError) -> VmorchError {
        self.armed = false;

        let leases = std::mem::take(&mut self.leases);
        let release_errors = self.instance.release_leases(leases).await;
        if let Some(mut vmm) = self.vmm.take() {
            vmm.stop().await;
        }

        self.instance.mark_failed(&cause);
        self.instance.note_release_errors(&release_errors);
        cause
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!(
            instance_id = %self.instance.id(),
            leases = self.leases.len(),
            "Launch abandoned, releasing resources"
        );
        self.leases.clear();
        self.vmm.take();
        self.instance.mark_failed(&VmorchError::Cancelled);
    }
}
