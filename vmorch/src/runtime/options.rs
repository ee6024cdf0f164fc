//! Runtime and per-instance options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vmorch_shared::Transport;
use vmorch_shared::errors::{VmorchError, VmorchResult};

use crate::net::NetworkOptions;
use crate::spec::ValidatorConfig;
use crate::vmm::ControlSurface;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "VMORCH_HOME";

/// Options fixed for the lifetime of a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorOptions {
    /// Holds the audit database, logs and default control sockets.
    pub home_dir: PathBuf,
    /// Bound on every control-surface call.
    pub request_timeout_ms: u64,
    pub validation: ValidatorConfig,
    pub network: NetworkOptions,
    /// VMM binary launched per instance. When unset, the VMM is expected
    /// to be listening already.
    pub vmm_binary: Option<PathBuf>,
    /// Extra arguments passed after `--api-sock <path>`.
    pub vmm_args: Vec<String>,
    /// How long a launched VMM may take to open its control socket.
    pub vmm_ready_timeout_ms: u64,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            request_timeout_ms: 5_000,
            validation: ValidatorConfig::default(),
            network: NetworkOptions::default(),
            vmm_binary: None,
            vmm_args: Vec::new(),
            vmm_ready_timeout_ms: 5_000,
        }
    }
}

impl OrchestratorOptions {
    /// Load options from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &std::path::Path) -> VmorchResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VmorchError::Config(format!(
                "Failed to read options {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| VmorchError::Config(format!("Invalid options TOML: {}", e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn vmm_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.vmm_ready_timeout_ms)
    }
}

/// `$VMORCH_HOME`, else `~/.vmorch`, else `<tmp>/vmorch`.
pub fn default_home_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|home| home.join(".vmorch"))
        .unwrap_or_else(|| std::env::temp_dir().join("vmorch"))
}

/// Options for one instance.
#[derive(Clone, Default)]
pub struct InstanceOptions {
    /// Unique among the runtime's instances.
    pub name: Option<String>,
    /// Control endpoint. Defaults to `<home>/sockets/<id>.sock`.
    pub transport: Option<Transport>,
    /// Overrides the HTTP control surface built from `transport`.
    pub control_surface: Option<Arc<dyn ControlSurface>>,
}

impl InstanceOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn control_surface(mut self, surface: Arc<dyn ControlSurface>) -> Self {
        self.control_surface = Some(surface);
        self
    }
}

impl std::fmt::Debug for InstanceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceOptions")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("control_surface", &self.control_surface.is_some())
            .finish()
    }
}
