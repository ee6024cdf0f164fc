//! End-to-end launch/stop scenarios against fake VMM and host networking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hyper::Method;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use vmorch::lifecycle::transition;
use vmorch::net::{HostNetwork, TapAddress};
use vmorch::spec::{FaascaleMemSpec, NetworkInterfaceSpec};
use vmorch::vmm::{ControlResponse, ControlSurface};
use vmorch::{
    CancellationToken, InstanceOptions, InstancePhase, InstanceSpec, LifecycleEvent,
    OrchestratorOptions, StepFailure, ValidatorConfig, VmorchError, VmorchResult, VmorchRuntime,
};

// ============================================================================
// FAKES
// ============================================================================

/// VMM control surface that records every call.
#[derive(Default)]
struct FakeVmm {
    calls: Mutex<Vec<String>>,
    /// Resource answered with the given status.
    reject: Mutex<Option<(String, u16)>>,
    /// Resource that never answers.
    hang: Option<&'static str>,
}

impl FakeVmm {
    fn rejecting(resource: &str, status: u16) -> Arc<Self> {
        let vmm = Self::default();
        *vmm.reject.lock() = Some((resource.to_string(), status));
        Arc::new(vmm)
    }

    fn hanging(resource: &'static str) -> Arc<Self> {
        Arc::new(Self {
            hang: Some(resource),
            ..Default::default()
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ControlSurface for FakeVmm {
    async fn request(
        &self,
        method: Method,
        resource: &str,
        _payload: Option<&Value>,
    ) -> Result<ControlResponse, StepFailure> {
        self.calls.lock().push(format!("{} {}", method, resource));

        if self.hang == Some(resource) {
            std::future::pending::<()>().await;
        }

        let rejected = self
            .reject
            .lock()
            .as_ref()
            .filter(|(r, _)| r == resource)
            .map(|(_, status)| *status);
        if let Some(status) = rejected {
            return Ok(ControlResponse::new(
                status,
                r#"{"fault_message":"rejected by fake"}"#,
            ));
        }

        if method == Method::GET {
            return Ok(ControlResponse::new(
                200,
                r#"{"target_pages":32768,"actual_pages":32768,"target_mib":128,
                    "actual_mib":128,"free_memory":1048576}"#,
            ));
        }
        Ok(ControlResponse::no_content())
    }
}

/// Host networking that counts tap creation and removal.
struct CountingHost {
    created: AtomicU64,
    destroyed: AtomicU64,
    fail_create: Option<&'static str>,
    fail_remove_nat: bool,
    /// Probability of any setup call failing.
    fail_rate: f64,
    rng: Mutex<StdRng>,
}

impl Default for CountingHost {
    fn default() -> Self {
        Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            fail_create: None,
            fail_remove_nat: false,
            fail_rate: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }
}

impl CountingHost {
    fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, op: &str, dev: &str) -> VmorchResult<()> {
        if self.fail_rate > 0.0 && self.rng.lock().random_bool(self.fail_rate) {
            return Err(VmorchError::NetworkResource(format!("{} {} injected", op, dev)));
        }
        Ok(())
    }
}

#[async_trait]
impl HostNetwork for CountingHost {
    async fn create_tap(&self, dev: &str) -> VmorchResult<()> {
        if self.fail_create == Some(dev) {
            return Err(VmorchError::NetworkResource(format!("cannot create {}", dev)));
        }
        self.maybe_fail("create", dev)?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn assign_address(&self, dev: &str, _address: &TapAddress) -> VmorchResult<()> {
        self.maybe_fail("addr", dev)
    }

    async fn set_link_up(&self, dev: &str) -> VmorchResult<()> {
        self.maybe_fail("link", dev)
    }

    async fn install_nat(&self, dev: &str, _egress: &str) -> VmorchResult<()> {
        self.maybe_fail("nat", dev)
    }

    async fn remove_nat(&self, dev: &str, _egress: &str) -> VmorchResult<()> {
        if self.fail_remove_nat {
            return Err(VmorchError::NetworkResource(format!("rule for {} missing", dev)));
        }
        Ok(())
    }

    async fn destroy_tap(&self, _dev: &str) -> VmorchResult<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn options(home: &std::path::Path, request_timeout_ms: u64) -> OrchestratorOptions {
    OrchestratorOptions {
        home_dir: home.to_path_buf(),
        request_timeout_ms,
        validation: ValidatorConfig {
            check_paths: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn runtime(host: Arc<CountingHost>) -> (tempfile::TempDir, VmorchRuntime) {
    runtime_with_timeout(host, 1_000)
}

fn runtime_with_timeout(
    host: Arc<CountingHost>,
    request_timeout_ms: u64,
) -> (tempfile::TempDir, VmorchRuntime) {
    let dir = tempfile::tempdir().unwrap();
    let rt =
        VmorchRuntime::with_host_network(options(dir.path(), request_timeout_ms), host).unwrap();
    (dir, rt)
}

/// 2 vCPUs, 1024 MiB, one interface eth0 on tap0.
fn scenario_spec() -> InstanceSpec {
    InstanceSpec::new("/boot/vmlinux", "/img/rootfs.ext4", 2, 1024)
        .boot_args("console=ttyS0 reboot=k panic=1 pci=off")
        .with_interface(NetworkInterfaceSpec::new("eth0", "AA:FC:00:00:00:01", "tap0"))
}

fn with_vmm(vmm: &Arc<FakeVmm>) -> InstanceOptions {
    InstanceOptions::default().control_surface(Arc::clone(vmm) as Arc<dyn ControlSurface>)
}

async fn wait_for_releases(rt: &VmorchRuntime, expected: u64) {
    for _ in 0..200 {
        if rt.network_stats().released >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {} releases, saw {:?}",
        expected,
        rt.network_stats()
    );
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_happy_path_reaches_running_and_stops() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = Arc::new(FakeVmm::default());

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    assert_eq!(instance.phase(), InstancePhase::Unconfigured);

    instance.launch().await.unwrap();

    assert_eq!(instance.phase(), InstancePhase::Running);
    let state = instance.state();
    assert!(state.steps().iter().all(|s| s.succeeded()));
    assert_eq!(
        state.step_names(),
        vec!["boot-source", "drive(rootfs)", "machine-config", "network(eth0)", "start"]
    );

    let network = instance.network().await;
    assert_eq!(network.len(), 1);
    assert_eq!(network[0].0, "tap0");
    assert_eq!(network[0].1.host.to_string(), "172.16.0.1");
    assert_eq!(network[0].1.guest.to_string(), "172.16.0.2");

    let report = instance.stop().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.released, 1);
    assert_eq!(instance.phase(), InstancePhase::Stopped);
    assert_eq!(host.created(), host.destroyed());

    let metrics = rt.metrics().snapshot();
    assert_eq!(metrics.instances_created, 1);
    assert_eq!(metrics.instances_started, 1);
    assert_eq!(metrics.instances_stopped, 1);
    assert_eq!(metrics.instances_failed, 0);
}

#[tokio::test]
async fn test_steps_follow_dependency_order() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(host);
    let vmm = Arc::new(FakeVmm::default());

    let spec = InstanceSpec::new("/k", "/r", 1, 512)
        .with_drive("data", "/img/data.ext4", true)
        .with_balloon(64, true, 1)
        .with_faascale_mem(FaascaleMemSpec::default())
        .with_interface(NetworkInterfaceSpec::new("eth0", "AA:FC:00:00:00:01", "tap0"))
        .with_interface(NetworkInterfaceSpec::new("eth1", "AA:FC:00:00:00:02", "tap1"));

    let instance = rt.create(spec, with_vmm(&vmm)).unwrap();
    instance.launch().await.unwrap();

    assert_eq!(
        vmm.calls(),
        vec![
            "PUT /boot-source",
            "PUT /drives/rootfs",
            "PUT /drives/data",
            "PUT /machine-config",
            "PUT /balloon",
            "PUT /faascale-mem",
            "PUT /network-interfaces/eth0",
            "PUT /network-interfaces/eth1",
            "PUT /actions",
        ]
    );
}

#[tokio::test]
async fn test_machine_config_rejected_fails_and_releases_tap() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = FakeVmm::rejecting("/machine-config", 400);

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    let err = instance.launch().await.unwrap_err();

    match &err {
        VmorchError::Sequencer { step, cause } => {
            assert_eq!(step, "machine-config");
            assert!(matches!(
                cause,
                StepFailure::Status { status: 400, fault: Some(f) } if f == "rejected by fake"
            ));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(instance.phase(), InstancePhase::Failed);
    assert!(!vmm.calls().iter().any(|c| c.contains("/network-interfaces")));
    assert!(!vmm.calls().iter().any(|c| c.contains("/actions")));

    assert_eq!(host.created(), 1);
    assert_eq!(host.destroyed(), 1);
    let stats = rt.network_stats();
    assert_eq!(stats.acquired, stats.released);

    let state = instance.state();
    assert!(state.last_error().unwrap().contains("machine-config"));
    assert_eq!(state.steps().last().unwrap().status, Some(400));
    assert_eq!(rt.metrics().instances_failed(), 1);
}

#[tokio::test]
async fn test_duplicate_interface_ids_rejected_before_any_side_effect() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = Arc::new(FakeVmm::default());

    let spec = scenario_spec().with_interface(NetworkInterfaceSpec::new(
        "eth0",
        "AA:FC:00:00:00:02",
        "tap1",
    ));
    let instance = rt.create(spec, with_vmm(&vmm)).unwrap();
    let err = instance.launch().await.unwrap_err();

    assert!(err.is_validation());
    assert!(err.invalid_field().unwrap().contains("iface_id"));
    assert!(vmm.calls().is_empty());
    assert_eq!(host.created(), 0);
    assert_eq!(instance.phase(), InstancePhase::Failed);
}

#[tokio::test]
async fn test_non_positive_resources_never_reach_the_vmm() {
    for (vcpus, mem, field) in [
        (0, 128, "vcpu_count"),
        (-1, 128, "vcpu_count"),
        (1, 0, "mem_size_mib"),
        (1, -512, "mem_size_mib"),
    ] {
        let host = Arc::new(CountingHost::default());
        let (_dir, rt) = runtime(Arc::clone(&host));
        let vmm = Arc::new(FakeVmm::default());

        let instance = rt
            .create(InstanceSpec::new("/k", "/r", vcpus, mem), with_vmm(&vmm))
            .unwrap();
        let err = instance.launch().await.unwrap_err();

        assert_eq!(err.invalid_field(), Some(field));
        assert!(vmm.calls().is_empty());
        assert_eq!(host.created(), 0);
    }
}

#[tokio::test]
async fn test_start_rejected_fails_instance() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = FakeVmm::rejecting("/actions", 500);

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    let err = instance.launch().await.unwrap_err();

    assert_eq!(err.failed_step(), Some("start"));
    assert_eq!(instance.phase(), InstancePhase::Failed);
    assert_eq!(host.created(), host.destroyed());
}

#[tokio::test]
async fn test_request_timeout_is_a_sequencer_error() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime_with_timeout(Arc::clone(&host), 50);
    let vmm = FakeVmm::hanging("/machine-config");

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    let err = instance.launch().await.unwrap_err();

    assert!(matches!(
        err,
        VmorchError::Sequencer {
            ref step,
            cause: StepFailure::Timeout(_)
        } if step == "machine-config"
    ));
    assert_eq!(host.created(), host.destroyed());
}

#[tokio::test]
async fn test_network_failure_aborts_before_any_vmm_call() {
    let host = Arc::new(CountingHost {
        fail_create: Some("tap1"),
        ..Default::default()
    });
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = Arc::new(FakeVmm::default());

    let spec = scenario_spec().with_interface(NetworkInterfaceSpec::new(
        "eth1",
        "AA:FC:00:00:00:02",
        "tap1",
    ));
    let instance = rt.create(spec, with_vmm(&vmm)).unwrap();
    let err = instance.launch().await.unwrap_err();

    assert!(matches!(err, VmorchError::NetworkResource(_)));
    assert!(vmm.calls().is_empty());
    assert_eq!(host.created(), 1);
    assert_eq!(host.destroyed(), 1);
    assert_eq!(instance.phase(), InstancePhase::Failed);
}

#[tokio::test]
async fn test_second_launch_is_an_invalid_transition() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(host);
    let vmm = Arc::new(FakeVmm::default());

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    instance.launch().await.unwrap();
    let calls = vmm.calls().len();

    let err = instance.launch().await.unwrap_err();
    assert!(matches!(
        err,
        VmorchError::InvalidTransition {
            from: InstancePhase::Running,
            attempted: LifecycleEvent::BeginConfigure
        }
    ));
    assert_eq!(instance.phase(), InstancePhase::Running);
    assert_eq!(vmm.calls().len(), calls);
}

#[tokio::test]
async fn test_failed_stop_request_keeps_instance_running() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = Arc::new(FakeVmm::default());

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    instance.launch().await.unwrap();

    *vmm.reject.lock() = Some(("/actions".to_string(), 400));
    let err = instance.stop().await.unwrap_err();
    assert_eq!(err.failed_step(), Some("stop"));
    assert_eq!(instance.phase(), InstancePhase::Running);
    assert_eq!(host.destroyed(), 0);

    *vmm.reject.lock() = None;
    instance.stop().await.unwrap();
    assert_eq!(instance.phase(), InstancePhase::Stopped);
    assert_eq!(host.destroyed(), 1);
}

#[tokio::test]
async fn test_release_errors_are_reported_not_raised() {
    let host = Arc::new(CountingHost {
        fail_remove_nat: true,
        ..Default::default()
    });
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = Arc::new(FakeVmm::default());

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    instance.launch().await.unwrap();

    let report = instance.stop().await.unwrap();
    assert_eq!(report.released, 0);
    assert_eq!(report.release_errors.len(), 1);
    assert!(report.release_errors[0].starts_with("tap0"));

    assert_eq!(instance.phase(), InstancePhase::Stopped);
    assert!(
        instance
            .state()
            .last_error()
            .unwrap()
            .contains("network release failed")
    );
    assert_eq!(host.destroyed(), 1);
}

#[tokio::test]
async fn test_launch_cleanup_errors_follow_the_cause() {
    let host = Arc::new(CountingHost {
        fail_remove_nat: true,
        ..Default::default()
    });
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = FakeVmm::rejecting("/machine-config", 400);

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    instance.launch().await.unwrap_err();

    let state = instance.state();
    let last_error = state.last_error().unwrap();
    assert!(last_error.starts_with("configuration step 'machine-config' failed"));
    assert!(last_error.contains("network release failed: tap0"));
    assert_eq!(instance.phase(), InstancePhase::Failed);
}

// ============================================================================
// CRASH HANDLING
// ============================================================================

#[tokio::test]
async fn test_crash_releases_networking_once() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = Arc::new(FakeVmm::default());

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    instance.launch().await.unwrap();
    // No owned process, nothing to notice.
    assert_eq!(instance.check_health().await.unwrap(), InstancePhase::Running);

    instance.crash_detected("guest panic").await.unwrap();

    assert_eq!(instance.phase(), InstancePhase::Failed);
    assert_eq!(instance.state().last_error(), Some("crash detected: guest panic"));
    assert!(instance.network().await.is_empty());

    let stats = rt.network_stats();
    assert_eq!(stats.acquired, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(host.created(), host.destroyed());
    assert_eq!(rt.metrics().instances_failed(), 1);

    let err = instance.crash_detected("again").await.unwrap_err();
    assert!(matches!(
        err,
        VmorchError::InvalidTransition {
            from: InstancePhase::Failed,
            attempted: LifecycleEvent::CrashDetected
        }
    ));
    assert_eq!(rt.metrics().instances_failed(), 1);
    assert!(matches!(
        instance.stop().await,
        Err(VmorchError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_crash_records_release_errors() {
    let host = Arc::new(CountingHost {
        fail_remove_nat: true,
        ..Default::default()
    });
    let (_dir, rt) = runtime(Arc::clone(&host));
    let vmm = Arc::new(FakeVmm::default());

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    instance.launch().await.unwrap();
    instance.crash_detected("guest panic").await.unwrap();

    let state = instance.state();
    let last_error = state.last_error().unwrap();
    assert!(last_error.starts_with("crash detected: guest panic; "));
    assert!(last_error.contains("network release failed: tap0"));
    assert!(last_error.contains("rule for tap0 missing"));

    let record = rt.audit(instance.id()).unwrap().unwrap();
    assert_eq!(record.last_error.as_deref(), Some(last_error));
}

/// Owned VMM that exits on its own shortly after start.
#[cfg(unix)]
fn short_lived_vmm(dir: &std::path::Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-vmm.sh");
    std::fs::write(&path, "#!/bin/sh\nsleep 1\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
#[tokio::test]
async fn test_exited_vmm_process_is_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(CountingHost::default());
    let mut opts = options(dir.path(), 1_000);
    opts.vmm_binary = Some(short_lived_vmm(dir.path()));
    let rt = VmorchRuntime::with_host_network(opts, Arc::clone(&host) as Arc<dyn HostNetwork>)
        .unwrap();
    let vmm = Arc::new(FakeVmm::default());

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();

    // Stand in for the VMM's control socket once the stale one is gone.
    let socket = instance.transport().socket_path().unwrap().to_path_buf();
    let listener = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _listener = tokio::net::UnixListener::bind(&socket).unwrap();
        std::future::pending::<()>().await;
    });

    instance.launch().await.unwrap();
    assert_eq!(instance.phase(), InstancePhase::Running);
    assert!(instance.vmm_pid().await.is_some());

    let mut phase = InstancePhase::Running;
    for _ in 0..100 {
        phase = instance.check_health().await.unwrap();
        if phase != InstancePhase::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    listener.abort();

    assert_eq!(phase, InstancePhase::Failed);
    assert_eq!(
        instance.state().last_error(),
        Some("crash detected: VMM process exited")
    );
    assert_eq!(host.created(), host.destroyed());
    assert_eq!(rt.metrics().instances_failed(), 1);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn test_cancelled_launch_releases_leases() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime_with_timeout(Arc::clone(&host), 60_000);
    let vmm = FakeVmm::hanging("/machine-config");

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
    }

    let err = instance.launch_with_cancel(cancel).await.unwrap_err();
    assert!(matches!(err, VmorchError::Cancelled));
    assert_eq!(instance.phase(), InstancePhase::Failed);
    assert_eq!(instance.state().last_error(), Some("orchestration cancelled"));

    let stats = rt.network_stats();
    assert_eq!(stats.acquired, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(host.created(), host.destroyed());
}

#[tokio::test]
async fn test_dropped_launch_future_releases_leases() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime_with_timeout(Arc::clone(&host), 60_000);
    let vmm = FakeVmm::hanging("/machine-config");

    let instance = rt.create(scenario_spec(), with_vmm(&vmm)).unwrap();
    let timed_out = tokio::time::timeout(Duration::from_millis(50), instance.launch()).await;
    assert!(timed_out.is_err());

    assert_eq!(instance.phase(), InstancePhase::Failed);
    wait_for_releases(&rt, 1).await;
    assert_eq!(host.created(), host.destroyed());
}

// ============================================================================
// POST-BOOT OPERATIONS
// ============================================================================

#[tokio::test]
async fn test_balloon_updates_and_statistics() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(host);
    let vmm = Arc::new(FakeVmm::default());

    let instance = rt
        .create(scenario_spec().with_balloon(0, false, 1), with_vmm(&vmm))
        .unwrap();

    // Not running yet.
    assert!(matches!(
        instance.update_balloon(128).await,
        Err(VmorchError::InvalidState(_))
    ));

    instance.launch().await.unwrap();
    instance.update_balloon(128).await.unwrap();
    instance.update_balloon(256).await.unwrap();
    instance.update_balloon_stats_interval(5).await.unwrap();

    let stats = instance.balloon_stats().await.unwrap();
    assert_eq!(stats.target_mib, 128);
    assert_eq!(stats.memory.free_memory, Some(1_048_576));

    let err = instance.update_balloon(4096).await.unwrap_err();
    assert_eq!(err.invalid_field(), Some("balloon.amount_mib"));

    let calls = vmm.calls();
    assert!(calls.contains(&"PATCH /balloon".to_string()));
    assert!(calls.contains(&"PATCH /balloon/statistics".to_string()));
    assert!(calls.contains(&"GET /balloon/statistics".to_string()));

    // faascale-mem was not configured.
    assert!(matches!(
        instance.faascale_mem_stats().await,
        Err(VmorchError::InvalidState(_))
    ));
}

// ============================================================================
// RUNTIME
// ============================================================================

#[tokio::test]
async fn test_audit_trail_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = FakeVmm::rejecting("/machine-config", 400);

    let (failed_id, running_id) = {
        let rt = VmorchRuntime::with_host_network(
            options(dir.path(), 1_000),
            Arc::new(CountingHost::default()),
        )
        .unwrap();

        let failed = rt
            .create(scenario_spec(), InstanceOptions::named("broken").control_surface(vmm))
            .unwrap();
        failed.launch().await.unwrap_err();

        let running = rt
            .create(
                InstanceSpec::new("/k", "/r", 1, 128),
                InstanceOptions::named("web").control_surface(Arc::new(FakeVmm::default())),
            )
            .unwrap();
        running.launch().await.unwrap();

        (failed.id().clone(), running.id().clone())
    };

    let rt = VmorchRuntime::with_host_network(
        options(dir.path(), 1_000),
        Arc::new(CountingHost::default()),
    )
    .unwrap();

    let infos = rt.list_info().unwrap();
    assert_eq!(infos.len(), 2);

    let record = rt.audit("broken").unwrap().unwrap();
    assert_eq!(record.id, failed_id);
    assert_eq!(record.phase, InstancePhase::Failed);
    assert_eq!(record.steps.last().unwrap().name, "machine-config");
    assert_eq!(record.steps.last().unwrap().status, Some(400));

    let running = rt.get_info(&running_id).unwrap().unwrap();
    assert_eq!(running.phase, InstancePhase::Failed);
    assert!(running.last_error.unwrap().contains("restarted"));
}

#[tokio::test]
async fn test_names_are_unique_and_active_instances_stay() {
    let host = Arc::new(CountingHost::default());
    let (_dir, rt) = runtime(host);
    let vmm = Arc::new(FakeVmm::default());

    let instance = rt
        .create(
            scenario_spec(),
            InstanceOptions::named("web").control_surface(Arc::clone(&vmm) as Arc<dyn ControlSurface>),
        )
        .unwrap();
    assert!(rt.create(scenario_spec(), InstanceOptions::named("web")).is_err());

    instance.launch().await.unwrap();
    assert!(matches!(rt.remove("web"), Err(VmorchError::InvalidState(_))));

    instance.stop().await.unwrap();
    rt.remove("web").unwrap();
    assert!(!rt.exists("web").unwrap());
    assert!(rt.get(instance.id()).unwrap().is_none());
}

#[test]
fn test_transition_function_is_total() {
    let mut allowed = 0;
    for phase in InstancePhase::ALL {
        for event in LifecycleEvent::ALL {
            match transition(phase, event) {
                Ok(_) => allowed += 1,
                Err(VmorchError::InvalidTransition { from, attempted }) => {
                    assert_eq!(from, phase);
                    assert_eq!(attempted, event);
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }
    assert_eq!(allowed, 9);
}

// ============================================================================
// RELEASE PARITY
// ============================================================================

/// Randomized failure injection: every tap that was set up is torn down.
#[tokio::test]
async fn test_release_parity_under_random_failures() {
    let host = Arc::new(CountingHost {
        fail_rate: 0.05,
        rng: Mutex::new(StdRng::seed_from_u64(0x5eed)),
        ..Default::default()
    });
    let (_dir, rt) = runtime(Arc::clone(&host));
    let mut rng = StdRng::seed_from_u64(42);

    let reject_points = [
        None,
        Some("/boot-source"),
        Some("/drives/rootfs"),
        Some("/machine-config"),
        Some("/network-interfaces/eth1"),
        Some("/actions"),
    ];

    for _ in 0..1000 {
        let mut spec = InstanceSpec::new("/k", "/r", 1, 128);
        for i in 0..rng.random_range(1..=3) {
            spec = spec.with_interface(NetworkInterfaceSpec::new(
                format!("eth{}", i),
                format!("AA:FC:00:00:00:0{}", i),
                format!("tap{}", i),
            ));
        }

        let vmm = match reject_points[rng.random_range(0..reject_points.len())] {
            Some(resource) => FakeVmm::rejecting(resource, 400),
            None => Arc::new(FakeVmm::default()),
        };

        let instance = rt.create(spec, with_vmm(&vmm)).unwrap();
        if instance.launch().await.is_ok() {
            instance.stop().await.unwrap();
        }
        assert!(instance.phase().is_terminal());
    }

    let stats = rt.network_stats();
    assert!(stats.acquired > 0);
    assert_eq!(stats.acquired, stats.released);
    assert_eq!(host.created(), host.destroyed());
}
