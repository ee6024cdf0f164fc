//! Public runtime entry point.

use std::path::Path;
use std::sync::Arc;

use vmorch_shared::errors::VmorchResult;

use crate::db::InstanceRecord;
use crate::instance::Instance;
use crate::metrics::RuntimeMetrics;
use crate::net::{HostNetwork, IpCommandHost, LeaseStats};
use crate::runtime::options::{InstanceOptions, OrchestratorOptions};
use crate::runtime::rt_impl::{RuntimeInner, RuntimeInnerImpl};
use crate::runtime::types::InstanceInfo;
use crate::spec::InstanceSpec;

/// VmorchRuntime creates and tracks VM instances.
///
/// One runtime owns one home directory (audit database, logs, default
/// control sockets) and one network coordinator, shared by all of its
/// instances.
///
/// **Cloning**: cheap, via `Arc`; all clones share the same state.
#[derive(Clone)]
pub struct VmorchRuntime {
    inner: RuntimeInner,
}

impl VmorchRuntime {
    /// Runtime using `ip` and `iptables` for host networking.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `home_dir` is not absolute
    /// - Filesystem or database initialization fails
    /// - The network pool CIDR is invalid
    pub fn new(options: OrchestratorOptions) -> VmorchResult<Self> {
        Self::with_host_network(options, Arc::new(IpCommandHost::default()))
    }

    /// Runtime with custom host networking primitives.
    pub fn with_host_network(
        options: OrchestratorOptions,
        host: Arc<dyn HostNetwork>,
    ) -> VmorchResult<Self> {
        Ok(Self {
            inner: RuntimeInnerImpl::new(options, host)?,
        })
    }

    /// Register a new instance for `spec`.
    ///
    /// Nothing is validated or started yet; call [`Instance::launch`].
    pub fn create(&self, spec: InstanceSpec, options: InstanceOptions) -> VmorchResult<Instance> {
        self.inner.create(spec, options)
    }

    /// Handle to an instance by ID or name.
    pub fn get(&self, id_or_name: &str) -> VmorchResult<Option<Instance>> {
        self.inner.get(id_or_name)
    }

    pub fn get_info(&self, id_or_name: &str) -> VmorchResult<Option<InstanceInfo>> {
        self.inner.get_info(id_or_name)
    }

    /// All instances, newest first.
    pub fn list_info(&self) -> VmorchResult<Vec<InstanceInfo>> {
        self.inner.list_info()
    }

    pub fn exists(&self, id_or_name: &str) -> VmorchResult<bool> {
        Ok(self.inner.get_info(id_or_name)?.is_some())
    }

    /// Remove a stopped, failed or never launched instance.
    pub fn remove(&self, id_or_name: &str) -> VmorchResult<()> {
        self.inner.remove(id_or_name)
    }

    /// Audit record of an instance, step log included.
    pub fn audit(&self, id_or_name: &str) -> VmorchResult<Option<InstanceRecord>> {
        let Some(info) = self.inner.get_info(id_or_name)? else {
            return Ok(None);
        };
        self.inner.manager.store()?.load(&info.id)
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        self.inner.metrics()
    }

    pub fn network_stats(&self) -> LeaseStats {
        self.inner.network.stats()
    }

    pub fn home_dir(&self) -> &Path {
        self.inner.layout.home_dir()
    }
}

impl std::fmt::Debug for VmorchRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmorchRuntime")
            .field("home_dir", &self.inner.layout.home_dir())
            .finish()
    }
}

// Compile-time assertion that VmorchRuntime is Send + Sync.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<VmorchRuntime>();
};
