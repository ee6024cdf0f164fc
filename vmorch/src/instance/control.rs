//! Operations on a running instance.

use std::sync::atomic::Ordering;

use serde::Serialize;
use vmorch_shared::errors::{VmorchError, VmorchResult};
use vmorch_shared::lifecycle::{InstancePhase, LifecycleEvent};

use super::Instance;
use crate::lifecycle::is_allowed;
use crate::sequencer::ConfigurationStep;
use crate::vmm::api::{self, BalloonStats, BalloonUpdate, FaascaleMemStats, StatsIntervalUpdate};

/// Outcome of a successful stop.
///
/// Tap devices that could not be torn down are listed here; they never
/// turn a stop into an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Tap devices released.
    pub released: usize,
    pub release_errors: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.release_errors.is_empty()
    }
}

impl Instance {
    /// Stop a running instance and release its networking.
    ///
    /// A launched VMM process is killed; otherwise the guest is asked to
    /// shut down through the control surface. If that request fails the
    /// instance stays `Running` and the sequencer error is returned.
    pub async fn stop(&self) -> VmorchResult<StopReport> {
        let mut resources = self.slot.resources.lock().await;

        let phase = self.phase();
        if !is_allowed(phase, LifecycleEvent::Stop) {
            return Err(VmorchError::InvalidTransition {
                from: phase,
                attempted: LifecycleEvent::Stop,
            });
        }

        match resources.vmm.take() {
            Some(mut vmm) => vmm.stop().await,
            None => {
                if let Err(e) = self.sequencer.update(&ConfigurationStep::stop()?).await {
                    self.slot.state.lock().note_error(e.to_string());
                    self.persist_or_warn();
                    return Err(e);
                }
            }
        }

        self.slot.state.lock().apply_event(LifecycleEvent::Stop)?;

        let leases = std::mem::take(&mut resources.leases);
        let total = leases.len();
        let release_errors = self.release_leases(leases).await;
        self.persist_or_warn();
        self.note_release_errors(&release_errors);

        self.runtime
            .runtime_metrics
            .instances_stopped
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(instance_id = %self.id(), "Instance stopped");

        Ok(StopReport {
            released: total - release_errors.len(),
            release_errors,
        })
    }

    /// Record that the guest died underneath a running instance.
    ///
    /// The VMM and tap devices are released; release failures are appended
    /// to the recorded crash cause.
    pub async fn crash_detected(&self, reason: &str) -> VmorchResult<()> {
        let mut resources = self.slot.resources.lock().await;

        {
            let mut state = self.slot.state.lock();
            state.apply_event(LifecycleEvent::CrashDetected)?;
            state.note_error(format!("crash detected: {}", reason));
        }
        tracing::error!(instance_id = %self.id(), reason, "Instance crashed");

        if let Some(mut vmm) = resources.vmm.take() {
            vmm.stop().await;
        }
        let leases = std::mem::take(&mut resources.leases);
        let release_errors = self.release_leases(leases).await;
        self.persist_or_warn();
        self.note_release_errors(&release_errors);

        self.runtime
            .runtime_metrics
            .instances_failed
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Check the launched VMM process and fail the instance if it exited.
    pub async fn check_health(&self) -> VmorchResult<InstancePhase> {
        let exited = {
            let mut resources = self.slot.resources.lock().await;
            resources.vmm.as_mut().is_some_and(|vmm| !vmm.is_running())
        };

        if exited && self.phase() == InstancePhase::Running {
            self.crash_detected("VMM process exited").await?;
        }
        Ok(self.phase())
    }

    /// Resize the balloon of a running instance.
    pub async fn update_balloon(&self, amount_mib: u32) -> VmorchResult<()> {
        self.require_balloon()?;
        if i64::from(amount_mib) > self.spec().mem_size_mib {
            return Err(VmorchError::validation(
                "balloon.amount_mib",
                format!(
                    "{} exceeds mem_size_mib {}",
                    amount_mib,
                    self.spec().mem_size_mib
                ),
            ));
        }

        let step = ConfigurationStep::update(
            "balloon-update",
            api::BALLOON,
            &BalloonUpdate { amount_mib },
        )?;
        self.send_update(&step).await
    }

    pub async fn update_balloon_stats_interval(&self, interval_s: u16) -> VmorchResult<()> {
        self.require_balloon()?;
        let step = ConfigurationStep::update(
            "balloon-stats-update",
            api::BALLOON_STATISTICS,
            &StatsIntervalUpdate {
                stats_polling_interval_s: interval_s,
            },
        )?;
        self.send_update(&step).await
    }

    pub async fn balloon_stats(&self) -> VmorchResult<BalloonStats> {
        self.require_balloon()?;
        self.query("balloon-stats", api::BALLOON_STATISTICS).await
    }

    pub async fn update_faascale_mem_stats_interval(&self, interval_s: u16) -> VmorchResult<()> {
        self.require_faascale_mem()?;
        let step = ConfigurationStep::update(
            "faascale-mem-stats-update",
            api::FAASCALE_MEM_STATISTICS,
            &StatsIntervalUpdate {
                stats_polling_interval_s: interval_s,
            },
        )?;
        self.send_update(&step).await
    }

    pub async fn faascale_mem_stats(&self) -> VmorchResult<FaascaleMemStats> {
        self.require_faascale_mem()?;
        self.query("faascale-mem-stats", api::FAASCALE_MEM_STATISTICS)
            .await
    }

    async fn send_update(&self, step: &ConfigurationStep) -> VmorchResult<()> {
        let _resources = self.slot.resources.lock().await;
        let result = self.sequencer.update(step).await;
        self.persist_or_warn();
        result
    }

    async fn query<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        resource: &str,
    ) -> VmorchResult<T> {
        let _resources = self.slot.resources.lock().await;

        let phase = self.phase();
        if phase != InstancePhase::Running {
            return Err(VmorchError::InvalidState(format!(
                "'{}' requires a running instance, instance is {}",
                name, phase
            )));
        }

        self.sequencer
            .client()
            .get_json(resource)
            .await
            .map_err(|cause| VmorchError::Sequencer {
                step: name.to_string(),
                cause,
            })
    }

    fn require_balloon(&self) -> VmorchResult<()> {
        if self.spec().balloon.is_none() {
            return Err(VmorchError::InvalidState(format!(
                "instance {} has no balloon device",
                self.id()
            )));
        }
        Ok(())
    }

    fn require_faascale_mem(&self) -> VmorchResult<()> {
        if self.spec().faascale_mem.is_none() {
            return Err(VmorchError::InvalidState(format!(
                "instance {} has no faascale-mem device",
                self.id()
            )));
        }
        Ok(())
    }
}
