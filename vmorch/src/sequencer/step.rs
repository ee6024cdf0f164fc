//! Configuration steps derived from an instance spec.

use std::fmt;

use hyper::Method;
use serde::Serialize;
use serde_json::Value;
use vmorch_shared::errors::{VmorchError, VmorchResult};

use crate::spec::{InstanceSpec, ROOT_DRIVE_ID};
use crate::vmm::api::{self, ActionType, InstanceActionInfo};

/// Step names that must have succeeded before configuration is complete.
pub const MANDATORY_STEPS: [&str; 3] = ["boot-source", "drive(rootfs)", "machine-config"];

pub const START_STEP: &str = "start";

pub const STOP_STEP: &str = "stop";

/// Position of a step in the configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    BootSource,
    Drive,
    MachineConfig,
    Balloon,
    DeviceExtension,
    NetworkInterface,
    Start,
    /// Post-boot reconfiguration of an existing device.
    Update,
}

impl StepKind {
    /// Steps of lower rank must be applied first. Steps of equal rank keep
    /// plan order.
    pub fn rank(self) -> u8 {
        match self {
            StepKind::BootSource | StepKind::Drive => 0,
            StepKind::MachineConfig => 1,
            StepKind::Balloon | StepKind::DeviceExtension => 2,
            StepKind::NetworkInterface => 3,
            StepKind::Start => 4,
            StepKind::Update => 5,
        }
    }
}

/// One idempotent control-surface call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationStep {
    pub name: String,
    pub kind: StepKind,
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    pub resource: String,
    pub payload: Value,
}

fn serialize_method<S: serde::Serializer>(method: &Method, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(method.as_str())
}

impl ConfigurationStep {
    fn put<T: Serialize>(
        name: impl Into<String>,
        kind: StepKind,
        resource: impl Into<String>,
        body: &T,
    ) -> VmorchResult<Self> {
        Ok(Self {
            name: name.into(),
            kind,
            method: Method::PUT,
            resource: resource.into(),
            payload: serde_json::to_value(body)?,
        })
    }

    /// PATCH of a device that is already configured. May be applied any
    /// number of times with different payloads.
    pub fn update<T: Serialize>(
        name: impl Into<String>,
        resource: impl Into<String>,
        body: &T,
    ) -> VmorchResult<Self> {
        Ok(Self {
            name: name.into(),
            kind: StepKind::Update,
            method: Method::PATCH,
            resource: resource.into(),
            payload: serde_json::to_value(body)?,
        })
    }

    pub fn start() -> VmorchResult<Self> {
        Self::put(
            START_STEP,
            StepKind::Start,
            api::ACTIONS,
            &InstanceActionInfo::new(ActionType::InstanceStart),
        )
    }

    /// Ask the guest to shut down. Sent to a running instance.
    pub fn stop() -> VmorchResult<Self> {
        Self::put(
            STOP_STEP,
            StepKind::Update,
            api::ACTIONS,
            &InstanceActionInfo::new(ActionType::SendCtrlAltDel),
        )
    }

    pub fn is_update(&self) -> bool {
        self.kind == StepKind::Update
    }
}

impl fmt::Display for ConfigurationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.name, self.method, self.resource)
    }
}

/// Derive the configuration steps for `spec`, excluding `start`.
///
/// Deterministic: boot source, root drive, extra drives, machine config,
/// balloon, faascale-mem, then one step per network interface in spec
/// order. Expects a validated spec; out-of-range numbers are still
/// reported as validation errors.
pub fn plan_steps(spec: &InstanceSpec) -> VmorchResult<Vec<ConfigurationStep>> {
    let mut steps = Vec::new();

    steps.push(ConfigurationStep::put(
        "boot-source",
        StepKind::BootSource,
        api::BOOT_SOURCE,
        &api::BootSource {
            kernel_image_path: spec.kernel_image_path.clone(),
            boot_args: Some(spec.boot_args.clone()).filter(|a| !a.is_empty()),
        },
    )?);

    steps.push(ConfigurationStep::put(
        format!("drive({})", ROOT_DRIVE_ID),
        StepKind::Drive,
        api::drive_resource(ROOT_DRIVE_ID),
        &api::Drive {
            drive_id: ROOT_DRIVE_ID.to_string(),
            path_on_host: spec.rootfs_path.clone(),
            is_root_device: true,
            is_read_only: spec.rootfs_read_only,
        },
    )?);

    for drive in &spec.extra_drives {
        steps.push(ConfigurationStep::put(
            format!("drive({})", drive.drive_id),
            StepKind::Drive,
            api::drive_resource(&drive.drive_id),
            &api::Drive {
                drive_id: drive.drive_id.clone(),
                path_on_host: drive.path_on_host.clone(),
                is_root_device: false,
                is_read_only: drive.is_read_only,
            },
        )?);
    }

    steps.push(ConfigurationStep::put(
        "machine-config",
        StepKind::MachineConfig,
        api::MACHINE_CONFIG,
        &api::MachineConfiguration {
            vcpu_count: narrow("vcpu_count", spec.vcpu_count)?,
            mem_size_mib: narrow("mem_size_mib", spec.mem_size_mib)?,
        },
    )?);

    if let Some(balloon) = &spec.balloon {
        steps.push(ConfigurationStep::put(
            "balloon",
            StepKind::Balloon,
            api::BALLOON,
            &api::Balloon {
                amount_mib: narrow("balloon.amount_mib", balloon.amount_mib)?,
                deflate_on_oom: balloon.deflate_on_oom,
                stats_polling_interval_s: narrow(
                    "balloon.stats_polling_interval_s",
                    balloon.stats_polling_interval_s,
                )?,
            },
        )?);
    }

    if let Some(faascale) = &spec.faascale_mem {
        steps.push(ConfigurationStep::put(
            "faascale-mem",
            StepKind::DeviceExtension,
            api::FAASCALE_MEM,
            &api::FaascaleMem {
                stats_polling_interval_s: narrow(
                    "faascale_mem.stats_polling_interval_s",
                    faascale.stats_polling_interval_s,
                )?,
                pre_alloc_mem: faascale.pre_alloc_mem,
                pre_tdp_fault: faascale.pre_tdp_fault,
            },
        )?);
    }

    for iface in &spec.network_interfaces {
        steps.push(ConfigurationStep::put(
            format!("network({})", iface.iface_id),
            StepKind::NetworkInterface,
            api::network_interface_resource(&iface.iface_id),
            &api::NetworkInterface {
                iface_id: iface.iface_id.clone(),
                guest_mac: iface.guest_mac.clone(),
                host_dev_name: iface.host_dev_name.clone(),
            },
        )?);
    }

    Ok(steps)
}

fn narrow<T: TryFrom<i64>>(field: &str, value: i64) -> VmorchResult<T> {
    T::try_from(value)
        .map_err(|_| VmorchError::validation(field, format!("{} does not fit the wire type", value)))
}
