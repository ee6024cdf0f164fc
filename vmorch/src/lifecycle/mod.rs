//! Lifecycle state machine.
//!
//! ```text
//! Unconfigured → Configuring → Ready → Running → {Stopped, Failed}
//! ```

mod machine;
mod state;

pub use machine::{is_allowed, transition};
pub use state::{AppliedStep, InstanceState, SharedState, StepOutcome};
