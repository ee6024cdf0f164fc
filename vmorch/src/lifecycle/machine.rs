//! Lifecycle transition table.

use vmorch_shared::errors::{VmorchError, VmorchResult};
use vmorch_shared::lifecycle::{InstancePhase, LifecycleEvent};

/// Next phase for `event` in phase `from`.
///
/// Total over (phase, event): every pair without an entry below is an
/// `InvalidTransition`.
pub fn transition(from: InstancePhase, event: LifecycleEvent) -> VmorchResult<InstancePhase> {
    use InstancePhase::*;
    use LifecycleEvent::*;

    let next = match (from, event) {
        (Unconfigured, BeginConfigure) => Some(Configuring),
        (Configuring, ConfigurationComplete) => Some(Ready),
        (Ready, Start) => Some(Running),
        (Running, Stop) => Some(Stopped),
        (Running, CrashDetected) => Some(Failed),
        (phase, Fail) if !phase.is_terminal() => Some(Failed),
        _ => None,
    };

    next.ok_or(VmorchError::InvalidTransition {
        from,
        attempted: event,
    })
}

/// True if `event` is accepted in phase `from`.
pub fn is_allowed(from: InstancePhase, event: LifecycleEvent) -> bool {
    transition(from, event).is_ok()
}
