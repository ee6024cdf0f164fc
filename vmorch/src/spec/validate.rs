//! Resource descriptor validation.
//!
//! Runs before any external call is made. The only side effects are
//! read-only probes of the kernel, rootfs and drive paths.

use std::collections::HashSet;
use std::fs::File;
use std::ops::ControlFlow;
use std::path::Path;

use serde::{Deserialize, Serialize};
use vmorch_shared::errors::{FieldViolation, VmorchError, VmorchResult};

use super::{InstanceSpec, ROOT_DRIVE_ID};

/// 4 KiB guest pages per MiB.
const PAGES_PER_MIB: i64 = 256;
/// Largest balloon whose page count fits the device's `u32` target.
const MAX_BALLOON_MIB: i64 = u32::MAX as i64 / PAGES_PER_MIB;

/// Linux IFNAMSIZ minus the terminating NUL.
const MAX_IFNAME_LEN: usize = 15;

/// How many violations a validation run reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    /// Stop at the first violated field.
    #[default]
    FailFast,
    /// Check everything and report every violation.
    CollectAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub min_vcpus: i64,
    pub max_vcpus: i64,
    pub min_mem_mib: i64,
    pub max_mem_mib: i64,
    /// Probe kernel, rootfs and drive paths for existence and readability.
    pub check_paths: bool,
    pub report_mode: ReportMode,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_vcpus: 1,
            max_vcpus: 64,
            min_mem_mib: 1,
            max_mem_mib: 1024 * 1024,
            check_paths: true,
            report_mode: ReportMode::FailFast,
        }
    }
}

/// Validate with default bounds and fail-fast reporting.
pub fn validate(spec: &InstanceSpec) -> VmorchResult<()> {
    Validator::default().validate(spec)
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Check a spec.
    ///
    /// Returns `Validation` naming the first violated field, or in
    /// `CollectAll` mode `ValidationErrors` with every violation.
    pub fn validate(&self, spec: &InstanceSpec) -> VmorchResult<()> {
        let mut report = Report::new(self.config.report_mode);
        let _ = self.run_checks(spec, &mut report);
        report.into_result()
    }

    fn run_checks(&self, spec: &InstanceSpec, report: &mut Report) -> ControlFlow<()> {
        self.check_boot_source(spec, report)?;
        self.check_machine(spec, report)?;
        self.check_balloon(spec, report)?;
        self.check_faascale_mem(spec, report)?;
        self.check_drives(spec, report)?;
        self.check_interfaces(spec, report)
    }

    fn check_boot_source(&self, spec: &InstanceSpec, report: &mut Report) -> ControlFlow<()> {
        self.check_file("kernel_image_path", &spec.kernel_image_path, report)?;
        self.check_file("rootfs_path", &spec.rootfs_path, report)
    }

    fn check_machine(&self, spec: &InstanceSpec, report: &mut Report) -> ControlFlow<()> {
        let c = &self.config;

        if spec.vcpu_count < c.min_vcpus || spec.vcpu_count > c.max_vcpus {
            report.fail(
                "vcpu_count",
                format!(
                    "{} is outside the allowed range {}..={}",
                    spec.vcpu_count, c.min_vcpus, c.max_vcpus
                ),
            )?;
        }

        if spec.mem_size_mib < c.min_mem_mib {
            report.fail(
                "mem_size_mib",
                format!("{} MiB is below the minimum of {} MiB", spec.mem_size_mib, c.min_mem_mib),
            )?;
        } else if spec.mem_size_mib > c.max_mem_mib {
            report.fail(
                "mem_size_mib",
                format!("{} MiB exceeds the maximum of {} MiB", spec.mem_size_mib, c.max_mem_mib),
            )?;
        }

        ControlFlow::Continue(())
    }

    fn check_balloon(&self, spec: &InstanceSpec, report: &mut Report) -> ControlFlow<()> {
        let Some(balloon) = &spec.balloon else {
            return ControlFlow::Continue(());
        };

        if balloon.amount_mib < 0 {
            report.fail("balloon.amount_mib", "must not be negative")?;
        } else if balloon.amount_mib > spec.mem_size_mib {
            report.fail(
                "balloon.amount_mib",
                format!(
                    "{} MiB exceeds total memory of {} MiB",
                    balloon.amount_mib, spec.mem_size_mib
                ),
            )?;
        } else if balloon.amount_mib > MAX_BALLOON_MIB {
            report.fail("balloon.amount_mib", "amount of pages requested is too large")?;
        }

        check_interval("balloon.stats_polling_interval_s", balloon.stats_polling_interval_s, report)
    }

    fn check_faascale_mem(&self, spec: &InstanceSpec, report: &mut Report) -> ControlFlow<()> {
        match &spec.faascale_mem {
            Some(faascale) => check_interval(
                "faascale_mem.stats_polling_interval_s",
                faascale.stats_polling_interval_s,
                report,
            ),
            None => ControlFlow::Continue(()),
        }
    }

    fn check_drives(&self, spec: &InstanceSpec, report: &mut Report) -> ControlFlow<()> {
        let mut seen = HashSet::new();

        for (i, drive) in spec.extra_drives.iter().enumerate() {
            let field = format!("extra_drives[{}].drive_id", i);
            if drive.drive_id.is_empty() {
                report.fail(field, "must not be empty")?;
            } else if drive.drive_id == ROOT_DRIVE_ID {
                report.fail(field, format!("'{}' is reserved for the root device", ROOT_DRIVE_ID))?;
            } else if !seen.insert(drive.drive_id.as_str()) {
                report.fail(field, format!("duplicate drive id '{}'", drive.drive_id))?;
            }

            self.check_file(
                &format!("extra_drives[{}].path_on_host", i),
                &drive.path_on_host,
                report,
            )?;
        }

        ControlFlow::Continue(())
    }

    fn check_interfaces(&self, spec: &InstanceSpec, report: &mut Report) -> ControlFlow<()> {
        let mut ids = HashSet::new();
        let mut devices = HashSet::new();

        for (i, iface) in spec.network_interfaces.iter().enumerate() {
            let id_field = format!("network_interfaces[{}].iface_id", i);
            if iface.iface_id.is_empty() {
                report.fail(id_field, "must not be empty")?;
            } else if !ids.insert(iface.iface_id.as_str()) {
                report.fail(id_field, format!("duplicate interface id '{}'", iface.iface_id))?;
            }

            if !is_valid_mac(&iface.guest_mac) {
                report.fail(
                    format!("network_interfaces[{}].guest_mac", i),
                    format!("'{}' is not a valid MAC address", iface.guest_mac),
                )?;
            }

            let dev_field = format!("network_interfaces[{}].host_dev_name", i);
            if iface.host_dev_name.is_empty() {
                report.fail(dev_field, "must not be empty")?;
            } else if iface.host_dev_name.len() > MAX_IFNAME_LEN {
                report.fail(
                    dev_field,
                    format!("longer than {} bytes", MAX_IFNAME_LEN),
                )?;
            } else if !devices.insert(iface.host_dev_name.as_str()) {
                report.fail(
                    dev_field,
                    format!("duplicate host device '{}'", iface.host_dev_name),
                )?;
            }
        }

        ControlFlow::Continue(())
    }

    fn check_file(&self, field: &str, path: &Path, report: &mut Report) -> ControlFlow<()> {
        if path.as_os_str().is_empty() {
            return report.fail(field, "must not be empty");
        }
        if !self.config.check_paths {
            return ControlFlow::Continue(());
        }
        match probe_readable_file(path) {
            Ok(()) => ControlFlow::Continue(()),
            Err(reason) => report.fail(field, reason),
        }
    }
}

fn check_interval(field: &str, value: i64, report: &mut Report) -> ControlFlow<()> {
    if value < 0 || value > i64::from(u16::MAX) {
        return report.fail(field, format!("{} is outside 0..={}", value, u16::MAX));
    }
    ControlFlow::Continue(())
}

fn probe_readable_file(path: &Path) -> Result<(), String> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| format!("{} is not accessible: {}", path.display(), e))?;
    if !metadata.is_file() {
        return Err(format!("{} is not a regular file", path.display()));
    }
    File::open(path)
        .map(|_| ())
        .map_err(|e| format!("{} is not readable: {}", path.display(), e))
}

/// Six colon-separated hex octets, case-insensitive.
pub fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

struct Report {
    mode: ReportMode,
    violations: Vec<FieldViolation>,
}

impl Report {
    fn new(mode: ReportMode) -> Self {
        Self {
            mode,
            violations: Vec::new(),
        }
    }

    fn fail(&mut self, field: impl Into<String>, reason: impl Into<String>) -> ControlFlow<()> {
        let violation = FieldViolation::new(field, reason);
        tracing::debug!(field = %violation.field, reason = %violation.reason, "Spec violation");
        self.violations.push(violation);
        match self.mode {
            ReportMode::FailFast => ControlFlow::Break(()),
            ReportMode::CollectAll => ControlFlow::Continue(()),
        }
    }

    fn into_result(mut self) -> VmorchResult<()> {
        if self.violations.is_empty() {
            return Ok(());
        }
        match self.mode {
            ReportMode::FailFast => Err(self.violations.swap_remove(0).into()),
            ReportMode::CollectAll => Err(VmorchError::ValidationErrors(self.violations)),
        }
    }
}
