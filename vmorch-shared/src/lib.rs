//! Types shared between the vmorch orchestrator and its front-ends.
//!
//! - `errors`: the orchestrator error taxonomy
//! - `transport`: how the VMM control surface is reached
//! - `lifecycle`: instance phases and lifecycle events

pub mod errors;
pub mod lifecycle;
pub mod transport;

pub use errors::{FieldViolation, StepFailure, VmorchError, VmorchResult};
pub use lifecycle::{InstancePhase, LifecycleEvent};
pub use transport::Transport;
