use std::sync::{Arc, RwLock};

use chrono::Utc;
use vmorch_shared::Transport;
use vmorch_shared::errors::{VmorchError, VmorchResult};

use crate::db::{AuditStore, Database};
use crate::init_logging_for;
use crate::instance::{Instance, InstanceConfig, InstanceManager, InstanceSlot};
use crate::lifecycle::InstanceState;
use crate::metrics::{RuntimeMetrics, RuntimeMetricsStorage};
use crate::net::{HostNetwork, NetworkCoordinator};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::{InstanceOptions, OrchestratorOptions};
use crate::runtime::types::{InstanceInfo, generate_instance_id};
use crate::spec::{InstanceSpec, Validator};
use crate::vmm::{ControlSurface, HttpControlSurface, VmmLaunch};

/// Shared runtime state. Cloning is cheap.
pub type RuntimeInner = Arc<RuntimeInnerImpl>;

/// Runtime inner implementation.
///
/// **Locking Strategy**:
/// - `sync_state`: empty coordination lock, taken for multi-step manager
///   operations (name check + register, lookup + remove)
/// - The manager and the network coordinator lock internally
/// - Everything else is immutable after construction
pub struct RuntimeInnerImpl {
    pub(crate) sync_state: RwLock<SynchronizedState>,

    /// Instance registry with audit persistence (has internal RwLock)
    pub(crate) manager: InstanceManager,
    /// Host tap devices shared by every instance (has internal host lock)
    pub(crate) network: NetworkCoordinator,

    pub(crate) validator: Validator,
    pub(crate) layout: FilesystemLayout,
    pub(crate) options: OrchestratorOptions,
    /// Runtime-wide counters (AtomicU64, lock-free)
    pub(crate) runtime_metrics: Arc<RuntimeMetricsStorage>,
}

/// Empty coordination lock.
pub struct SynchronizedState;

impl RuntimeInnerImpl {
    /// Prepare the home directory, open the audit store and recover the
    /// instances it lists.
    pub fn new(
        options: OrchestratorOptions,
        host: Arc<dyn HostNetwork>,
    ) -> VmorchResult<RuntimeInner> {
        if !options.home_dir.is_absolute() {
            return Err(VmorchError::Config(format!(
                "home_dir must be absolute path, got: {}",
                options.home_dir.display()
            )));
        }

        let layout = FilesystemLayout::new(options.home_dir.clone());
        layout.prepare().map_err(|e| {
            VmorchError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        init_logging_for(&layout)?;

        let db = Database::open(&layout.db_path()).map_err(|e| {
            VmorchError::Storage(format!(
                "Failed to initialize database at {}: {}",
                layout.db_path().display(),
                e
            ))
        })?;

        let network = NetworkCoordinator::new(host, &options.network)?;

        let inner = Arc::new(Self {
            sync_state: RwLock::new(SynchronizedState),
            manager: InstanceManager::new(AuditStore::new(db)),
            network,
            validator: Validator::new(options.validation.clone()),
            layout,
            options,
            runtime_metrics: RuntimeMetricsStorage::new(),
        });

        tracing::debug!(home_dir = %inner.layout.home_dir().display(), "initialized runtime");

        inner.recover_instances()?;
        Ok(inner)
    }

    pub(crate) fn acquire_write(
        &self,
    ) -> VmorchResult<std::sync::RwLockWriteGuard<'_, SynchronizedState>> {
        self.sync_state
            .write()
            .map_err(|e| VmorchError::Internal(format!("Coordination lock poisoned: {}", e)))
    }

    /// Register a new, unconfigured instance.
    pub fn create(
        self: &Arc<Self>,
        spec: InstanceSpec,
        options: InstanceOptions,
    ) -> VmorchResult<Instance> {
        let _lock = self.acquire_write()?;

        if let Some(ref name) = options.name {
            if self.manager.get_by_name(name)?.is_some() {
                return Err(VmorchError::InvalidState(format!(
                    "instance with name '{}' already exists",
                    name
                )));
            }
        }

        let id = generate_instance_id();
        let transport = options
            .transport
            .unwrap_or_else(|| Transport::unix(self.layout.socket_path(&id)));

        if self.options.vmm_binary.is_some() && transport.socket_path().is_none() {
            return Err(VmorchError::Config(format!(
                "a launched VMM listens on a unix socket, got {}",
                transport
            )));
        }

        let surface: Arc<dyn ControlSurface> = match options.control_surface {
            Some(surface) => surface,
            None => Arc::new(HttpControlSurface::new(transport.clone())),
        };

        let config = InstanceConfig {
            id,
            name: options.name,
            created_at: Utc::now(),
            spec,
            transport,
        };
        let slot = InstanceSlot::new(config, InstanceState::new().shared(), surface);

        self.manager.register(slot.clone())?;

        self.runtime_metrics
            .instances_created
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(
            instance_id = %slot.config.id,
            transport = %slot.config.transport,
            "Instance created"
        );

        Ok(Instance::new(Arc::clone(self), slot))
    }

    /// Handle to an instance by ID or name.
    pub fn get(self: &Arc<Self>, id_or_name: &str) -> VmorchResult<Option<Instance>> {
        Ok(self
            .find(id_or_name)?
            .map(|slot| Instance::new(Arc::clone(self), slot)))
    }

    pub fn get_info(&self, id_or_name: &str) -> VmorchResult<Option<InstanceInfo>> {
        Ok(self.find(id_or_name)?.map(|slot| slot.info()))
    }

    /// All instances, newest first.
    pub fn list_info(&self) -> VmorchResult<Vec<InstanceInfo>> {
        self.manager.list()
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        RuntimeMetrics::new(Arc::clone(&self.runtime_metrics))
    }

    /// Forget an instance that holds no host resources.
    pub fn remove(&self, id_or_name: &str) -> VmorchResult<()> {
        let _lock = self.acquire_write()?;

        let slot = self
            .find(id_or_name)?
            .ok_or_else(|| VmorchError::NotFound(id_or_name.to_string()))?;

        let phase = slot.state.lock().phase();
        if phase.is_active() {
            return Err(VmorchError::InvalidState(format!(
                "cannot remove instance {} while {}; stop it first",
                slot.config.id, phase
            )));
        }

        self.manager.remove(&slot.config.id)?;

        // Only sockets we placed ourselves are cleaned up.
        if let Some(socket) = slot.config.transport.socket_path() {
            if socket.starts_with(self.layout.sockets_dir()) && socket.exists() {
                if let Err(e) = std::fs::remove_file(socket) {
                    tracing::warn!(
                        instance_id = %slot.config.id,
                        path = %socket.display(),
                        error = %e,
                        "Failed to remove control socket"
                    );
                }
            }
        }

        tracing::info!(instance_id = %slot.config.id, "Removed instance");
        Ok(())
    }

    fn find(&self, id_or_name: &str) -> VmorchResult<Option<InstanceSlot>> {
        if let Some(slot) = self.manager.get(id_or_name)? {
            return Ok(Some(slot));
        }
        self.manager.get_by_name(id_or_name)
    }

    /// Launch parameters when this runtime owns the VMM processes.
    pub(crate) fn vmm_launch(&self, config: &InstanceConfig) -> Option<VmmLaunch> {
        let binary = self.options.vmm_binary.clone()?;
        let socket_path = config.transport.socket_path()?.to_path_buf();

        Some(VmmLaunch {
            binary,
            socket_path,
            args: self.options.vmm_args.clone(),
            log_path: Some(self.layout.vmm_log_path(&config.id)),
            ready_timeout: self.options.vmm_ready_timeout(),
        })
    }

    /// Load instances persisted by earlier runs.
    ///
    /// Host resources do not survive the orchestrator, so instances that
    /// were active are marked failed.
    pub(crate) fn recover_instances(&self) -> VmorchResult<()> {
        let persisted = self.manager.load_all_persisted()?;
        tracing::info!("Recovering {} instances from database", persisted.len());

        let store = self.manager.store()?;
        for record in persisted {
            let config = InstanceConfig::from_record(&record);
            let mut state = record.state();

            let phase = state.phase();
            if phase.is_active() {
                state.fail(&VmorchError::InvalidState(format!(
                    "orchestrator restarted while instance was {}",
                    phase
                )));
                store.save_state(&config.id, &state)?;
                tracing::warn!(
                    instance_id = %config.id,
                    phase = %phase,
                    "Instance was active at shutdown, marked failed"
                );
            }

            let surface: Arc<dyn ControlSurface> =
                Arc::new(HttpControlSurface::new(config.transport.clone()));
            self.manager
                .register_recovered(InstanceSlot::new(config, state.shared(), surface))?;
        }

        tracing::info!("Instance recovery complete");
        Ok(())
    }
}

impl std::fmt::Debug for RuntimeInnerImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("home_dir", &self.layout.home_dir())
            .finish()
    }
}
