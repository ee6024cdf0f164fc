//! Declarative VM instance description.
//!
//! An `InstanceSpec` is created by the caller and never mutated once it has
//! been submitted to the runtime. Numeric fields are signed so that zero or
//! negative values reach the validator and are reported field by field
//! instead of failing at parse time.

mod validate;

pub use validate::{ReportMode, Validator, ValidatorConfig, is_valid_mac, validate};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vmorch_shared::errors::{VmorchError, VmorchResult};

/// Drive id under which the root filesystem is attached.
pub const ROOT_DRIVE_ID: &str = "rootfs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceSpec {
    /// Host path of the uncompressed guest kernel.
    pub kernel_image_path: PathBuf,
    /// Kernel command line.
    #[serde(default)]
    pub boot_args: String,
    /// Host path of the root filesystem image.
    pub rootfs_path: PathBuf,
    #[serde(default)]
    pub rootfs_read_only: bool,
    pub vcpu_count: i64,
    pub mem_size_mib: i64,
    #[serde(default)]
    pub balloon: Option<BalloonSpec>,
    /// Additional block devices, attached after the root device in order.
    #[serde(default)]
    pub extra_drives: Vec<DriveSpec>,
    /// faascale-mem device extension.
    #[serde(default)]
    pub faascale_mem: Option<FaascaleMemSpec>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BalloonSpec {
    /// Target balloon size in MiB.
    pub amount_mib: i64,
    #[serde(default)]
    pub deflate_on_oom: bool,
    /// Statistics polling interval; 0 disables statistics.
    #[serde(default)]
    pub stats_polling_interval_s: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriveSpec {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    #[serde(default)]
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaascaleMemSpec {
    #[serde(default)]
    pub stats_polling_interval_s: i64,
    /// Pre-allocate backing memory for faascale blocks.
    #[serde(default)]
    pub pre_alloc_mem: bool,
    /// Pre-fault two-dimensional paging entries for faascale blocks.
    #[serde(default)]
    pub pre_tdp_fault: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkInterfaceSpec {
    pub iface_id: String,
    pub guest_mac: String,
    /// Host tap device backing this interface.
    pub host_dev_name: String,
}

impl NetworkInterfaceSpec {
    pub fn new(
        iface_id: impl Into<String>,
        guest_mac: impl Into<String>,
        host_dev_name: impl Into<String>,
    ) -> Self {
        Self {
            iface_id: iface_id.into(),
            guest_mac: guest_mac.into(),
            host_dev_name: host_dev_name.into(),
        }
    }
}

impl InstanceSpec {
    /// Minimal spec: kernel, rootfs and machine resources.
    pub fn new(
        kernel_image_path: impl Into<PathBuf>,
        rootfs_path: impl Into<PathBuf>,
        vcpu_count: i64,
        mem_size_mib: i64,
    ) -> Self {
        Self {
            kernel_image_path: kernel_image_path.into(),
            boot_args: String::new(),
            rootfs_path: rootfs_path.into(),
            rootfs_read_only: false,
            vcpu_count,
            mem_size_mib,
            balloon: None,
            extra_drives: Vec::new(),
            faascale_mem: None,
            network_interfaces: Vec::new(),
        }
    }

    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.boot_args = args.into();
        self
    }

    pub fn read_only_rootfs(mut self) -> Self {
        self.rootfs_read_only = true;
        self
    }

    pub fn with_balloon(mut self, amount_mib: i64, deflate_on_oom: bool, interval_s: i64) -> Self {
        self.balloon = Some(BalloonSpec {
            amount_mib,
            deflate_on_oom,
            stats_polling_interval_s: interval_s,
        });
        self
    }

    pub fn with_drive(
        mut self,
        drive_id: impl Into<String>,
        path: impl Into<PathBuf>,
        read_only: bool,
    ) -> Self {
        self.extra_drives.push(DriveSpec {
            drive_id: drive_id.into(),
            path_on_host: path.into(),
            is_read_only: read_only,
        });
        self
    }

    pub fn with_faascale_mem(mut self, faascale: FaascaleMemSpec) -> Self {
        self.faascale_mem = Some(faascale);
        self
    }

    pub fn with_interface(mut self, iface: NetworkInterfaceSpec) -> Self {
        self.network_interfaces.push(iface);
        self
    }

    /// Load a spec document. `.toml` files are parsed as TOML, everything
    /// else as JSON.
    pub fn from_file(path: &Path) -> VmorchResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VmorchError::Config(format!(
                "Failed to read instance spec {}: {}",
                path.display(),
                e
            ))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    pub fn from_json_str(content: &str) -> VmorchResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| VmorchError::Config(format!("Invalid instance spec JSON: {}", e)))
    }

    pub fn from_toml_str(content: &str) -> VmorchResult<Self> {
        toml::from_str(content)
            .map_err(|e| VmorchError::Config(format!("Invalid instance spec TOML: {}", e)))
    }

    /// Host tap device names, in spec order.
    pub fn host_devices(&self) -> impl Iterator<Item = &str> {
        self.network_interfaces
            .iter()
            .map(|iface| iface.host_dev_name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_document() {
        let spec = InstanceSpec::from_json_str(
            r#"{
                "kernel_image_path": "/boot/vmlinux",
                "boot_args": "console=ttyS0 reboot=k panic=1 pci=off",
                "rootfs_path": "/img/root.ext4",
                "vcpu_count": 4,
                "mem_size_mib": 8192,
                "balloon": {"amount_mib": 0, "deflate_on_oom": false, "stats_polling_interval_s": 1},
                "network_interfaces": [
                    {"iface_id": "eth0", "guest_mac": "AA:FC:00:00:00:01", "host_dev_name": "tap0"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(spec.vcpu_count, 4);
        assert_eq!(spec.balloon.as_ref().unwrap().stats_polling_interval_s, 1);
        assert_eq!(spec.host_devices().collect::<Vec<_>>(), vec!["tap0"]);
        assert!(!spec.rootfs_read_only);
    }

    #[test]
    fn test_parse_toml_document() {
        let spec = InstanceSpec::from_toml_str(
            r#"
            kernel_image_path = "/boot/vmlinux"
            rootfs_path = "/img/root.ext4"
            vcpu_count = 2
            mem_size_mib = 1024

            [faascale_mem]
            stats_polling_interval_s = 5
            pre_alloc_mem = true

            [[extra_drives]]
            drive_id = "data"
            path_on_host = "/img/data.ext4"
            is_read_only = true
            "#,
        )
        .unwrap();

        assert_eq!(spec.extra_drives.len(), 1);
        assert!(spec.faascale_mem.as_ref().unwrap().pre_alloc_mem);
        assert!(!spec.faascale_mem.as_ref().unwrap().pre_tdp_fault);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = InstanceSpec::from_json_str(
            r#"{"kernel_image_path": "/k", "rootfs_path": "/r", "vcpu_count": 1,
                "mem_size_mib": 128, "cpu_template": "T2"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, VmorchError::Config(_)));
    }

    #[test]
    fn test_from_file_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.toml");
        std::fs::write(
            &path,
            "kernel_image_path = \"/k\"\nrootfs_path = \"/r\"\nvcpu_count = 1\nmem_size_mib = 64\n",
        )
        .unwrap();

        let spec = InstanceSpec::from_file(&path).unwrap();
        assert_eq!(spec, InstanceSpec::new("/k", "/r", 1, 64));
    }
}
