//! vmorch - lifecycle orchestration for HTTP-configured microVM monitors.
//!
//! A [`VmorchRuntime`] registers [`Instance`]s from declarative
//! [`InstanceSpec`]s. Launching an instance validates the spec, leases host
//! tap devices, sends the device configuration to the VMM control surface
//! in dependency order and starts the guest. Phases follow the lifecycle
//! state machine in [`lifecycle`]; every step is recorded in the audit
//! store.

pub mod db;
pub mod instance;
pub mod lifecycle;
mod logging;
pub mod metrics;
pub mod net;
pub mod pipeline;
pub mod runtime;
pub mod sequencer;
pub mod spec;
pub mod vmm;

pub use instance::{Instance, InstanceConfig, StopReport};
pub use lifecycle::{AppliedStep, InstanceState, StepOutcome};
pub use logging::{init_logging_for, init_stderr_logging};
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use runtime::{
    FilesystemLayout, InstanceId, InstanceInfo, InstanceOptions, OrchestratorOptions,
    VmorchRuntime,
};
pub use spec::{InstanceSpec, ReportMode, Validator, ValidatorConfig, validate};
pub use tokio_util::sync::CancellationToken;
pub use vmorch_shared::{
    FieldViolation, InstancePhase, LifecycleEvent, StepFailure, Transport, VmorchError,
    VmorchResult,
};
