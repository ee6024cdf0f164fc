//! Paired acquire/release of host tap devices.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vmorch_shared::errors::{VmorchError, VmorchResult};

use super::host::HostNetwork;
use super::pool::{AddressPool, TapAddress};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    /// Block the per-device /30 subnets are taken from.
    pub pool_cidr: String,
    /// Host interface NAT traffic leaves through.
    pub egress_interface: String,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            pool_cidr: "172.16.0.0/16".into(),
            egress_interface: "eth0".into(),
        }
    }
}

/// Lease counters since the coordinator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseStats {
    pub acquired: u64,
    pub released: u64,
}

/// Host-wide tap state. One per runtime, shared by every instance.
struct HostResources {
    live: HashMap<String, TapAddress>,
    pool: AddressPool,
}

struct CoordinatorInner {
    host: Arc<dyn HostNetwork>,
    egress: String,
    /// Global host-resource lock; held for the whole of a bring-up or
    /// teardown.
    resources: Mutex<HostResources>,
    acquired: AtomicU64,
    released: AtomicU64,
}

#[derive(Clone)]
pub struct NetworkCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for NetworkCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCoordinator")
            .field("egress", &self.inner.egress)
            .finish_non_exhaustive()
    }
}

impl NetworkCoordinator {
    pub fn new(host: Arc<dyn HostNetwork>, options: &NetworkOptions) -> VmorchResult<Self> {
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                host,
                egress: options.egress_interface.clone(),
                resources: Mutex::new(HostResources {
                    live: HashMap::new(),
                    pool: AddressPool::new(&options.pool_cidr)?,
                }),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        })
    }

    /// Create, address and bring up `dev`, then install its NAT rules.
    ///
    /// Rejected if a lease for `dev` is live. A failed bring-up undoes the
    /// sub-steps already done. The work runs on its own task, so cancelling
    /// the caller can neither interrupt it half-way nor lose the lease.
    pub async fn acquire(&self, dev: &str) -> VmorchResult<TapLease> {
        let coordinator = self.clone();
        let dev = dev.to_string();

        tokio::spawn(async move {
            let address = coordinator.inner.bring_up(&dev).await?;
            Ok::<_, VmorchError>(TapLease {
                dev,
                address,
                coordinator: Some(coordinator),
            })
        })
        .await
        .map_err(|e| VmorchError::Internal(format!("tap bring-up task failed: {}", e)))?
    }

    pub async fn live_count(&self) -> usize {
        self.inner.resources.lock().await.live.len()
    }

    pub async fn is_live(&self, dev: &str) -> bool {
        self.inner.resources.lock().await.live.contains_key(dev)
    }

    pub fn stats(&self) -> LeaseStats {
        LeaseStats {
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
        }
    }
}

impl CoordinatorInner {
    async fn bring_up(&self, dev: &str) -> VmorchResult<TapAddress> {
        let mut resources = self.resources.lock().await;

        if resources.live.contains_key(dev) {
            return Err(VmorchError::NetworkResource(format!(
                "tap device {} is already in use",
                dev
            )));
        }

        let address = resources.pool.allocate()?;
        if let Err(e) = self.setup(dev, &address).await {
            resources.pool.release(&address);
            tracing::warn!(dev, error = %e, "Tap bring-up failed");
            return Err(e);
        }

        resources.live.insert(dev.to_string(), address);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        tracing::info!(dev, %address, "Tap device acquired");
        Ok(address)
    }

    async fn setup(&self, dev: &str, address: &TapAddress) -> VmorchResult<()> {
        self.host.create_tap(dev).await?;

        let configured = async {
            self.host.assign_address(dev, address).await?;
            self.host.set_link_up(dev).await?;
            self.host.install_nat(dev, &self.egress).await
        }
        .await;

        if configured.is_err() {
            if let Err(e) = self.host.destroy_tap(dev).await {
                tracing::warn!(dev, error = %e, "Failed to remove tap after failed bring-up");
            }
        }
        configured
    }

    /// Remove rules and device, then free the name and subnet.
    ///
    /// The name is freed even if the host calls fail, so a device that is
    /// already gone does not wedge its name.
    async fn teardown(&self, dev: &str, address: TapAddress) -> VmorchResult<()> {
        let mut resources = self.resources.lock().await;

        let nat = self.host.remove_nat(dev, &self.egress).await;
        let tap = self.host.destroy_tap(dev).await;

        resources.live.remove(dev);
        resources.pool.release(&address);
        self.released.fetch_add(1, Ordering::Relaxed);

        match nat.and(tap) {
            Ok(()) => {
                tracing::info!(dev, "Tap device released");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(dev, error = %e, "Tap teardown incomplete");
                Err(e)
            }
        }
    }
}

/// A live tap device with its NAT rules.
///
/// Release it with [`TapLease::release`]. A lease dropped without being
/// released schedules its teardown on the current tokio runtime.
#[derive(Debug)]
pub struct TapLease {
    dev: String,
    address: TapAddress,
    coordinator: Option<NetworkCoordinator>,
}

impl TapLease {
    pub fn dev(&self) -> &str {
        &self.dev
    }

    pub fn address(&self) -> &TapAddress {
        &self.address
    }

    /// Tear the device down and wait for it.
    pub async fn release(mut self) -> VmorchResult<()> {
        let Some(coordinator) = self.coordinator.take() else {
            return Ok(());
        };
        let dev = std::mem::take(&mut self.dev);
        let address = self.address;

        tokio::spawn(async move { coordinator.inner.teardown(&dev, address).await })
            .await
            .map_err(|e| VmorchError::Internal(format!("tap teardown task failed: {}", e)))?
    }
}

impl Drop for TapLease {
    fn drop(&mut self) {
        let Some(coordinator) = self.coordinator.take() else {
            return;
        };
        let dev = std::mem::take(&mut self.dev);
        let address = self.address;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(dev = %dev, "Tap lease dropped, scheduling release");
                handle.spawn(async move {
                    let _ = coordinator.inner.teardown(&dev, address).await;
                });
            }
            Err(_) => {
                tracing::error!(dev = %dev, "Tap lease dropped outside a runtime; device leaked");
            }
        }
    }
}
