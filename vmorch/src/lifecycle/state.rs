//! Mutable per-instance state: phase, step log and last error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vmorch_shared::errors::{StepFailure, VmorchError, VmorchResult};
use vmorch_shared::lifecycle::{InstancePhase, LifecycleEvent};

use super::machine::transition;
use crate::sequencer::{ConfigurationStep, MANDATORY_STEPS, StepKind};

/// Instance state shared between the orchestrator and its pipeline tasks.
///
/// Never held across an `.await`.
pub type SharedState = Arc<Mutex<InstanceState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(StepOutcome::Succeeded),
            "failed" => Some(StepOutcome::Failed),
            _ => None,
        }
    }
}

/// Audit record of one attempted configuration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedStep {
    pub name: String,
    pub resource: String,
    pub payload: Value,
    pub outcome: StepOutcome,
    /// HTTP status, when the VMM answered.
    pub status: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

impl AppliedStep {
    pub fn succeeded(&self) -> bool {
        self.outcome == StepOutcome::Succeeded
    }
}

#[derive(Debug, Clone)]
pub struct InstanceState {
    phase: InstancePhase,
    steps: Vec<AppliedStep>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceState {
    pub fn new() -> Self {
        Self {
            phase: InstancePhase::Unconfigured,
            steps: Vec::new(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Rebuild state loaded from the audit store.
    pub fn restore(
        phase: InstancePhase,
        steps: Vec<AppliedStep>,
        last_error: Option<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            phase,
            steps,
            last_error,
            updated_at,
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub fn phase(&self) -> InstancePhase {
        self.phase
    }

    pub fn steps(&self) -> &[AppliedStep] {
        &self.steps
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Apply a lifecycle event.
    ///
    /// On rejection the phase is unchanged. `ConfigurationComplete` is also
    /// rejected until every mandatory step has succeeded.
    pub fn apply_event(&mut self, event: LifecycleEvent) -> VmorchResult<InstancePhase> {
        let next = transition(self.phase, event)?;

        if event == LifecycleEvent::ConfigurationComplete {
            if let Some(missing) = MANDATORY_STEPS.iter().find(|s| !self.has_succeeded(s)) {
                tracing::debug!(step = *missing, "Mandatory step has not succeeded");
                return Err(VmorchError::InvalidTransition {
                    from: self.phase,
                    attempted: event,
                });
            }
        }

        tracing::debug!(from = %self.phase, to = %next, %event, "Lifecycle transition");
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(next)
    }

    /// Move to `Failed` and record the cause.
    ///
    /// Terminal phases are left as they are; the cause is still recorded.
    pub fn fail(&mut self, cause: &VmorchError) -> InstancePhase {
        self.last_error = Some(cause.to_string());
        if !self.phase.is_terminal() {
            tracing::debug!(from = %self.phase, error = %cause, "Lifecycle transition to failed");
            self.phase = InstancePhase::Failed;
        }
        self.updated_at = Utc::now();
        self.phase
    }

    /// Record an error that did not change the phase.
    pub fn note_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// Add `message` after the recorded error, keeping the original cause first.
    pub fn append_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.last_error = Some(match self.last_error.take() {
            Some(cause) => format!("{}; {}", cause, message),
            None => message,
        });
        self.updated_at = Utc::now();
    }

    /// Check that `step` may be sent now.
    ///
    /// Configuration steps need `Configuring` (or `Ready` for `start`),
    /// updates need `Running`. A step already applied with a different
    /// payload is rejected unless it is an update.
    pub fn check_step(&self, step: &ConfigurationStep) -> VmorchResult<()> {
        let expected = match step.kind {
            StepKind::Start => InstancePhase::Ready,
            StepKind::Update => InstancePhase::Running,
            _ => InstancePhase::Configuring,
        };
        if self.phase != expected {
            return Err(VmorchError::InvalidState(format!(
                "step '{}' requires phase {}, instance is {}",
                step.name, expected, self.phase
            )));
        }

        if step.is_update() {
            return Ok(());
        }

        let conflicting = self
            .steps
            .iter()
            .any(|s| s.succeeded() && s.name == step.name && s.payload != step.payload);
        if conflicting {
            return Err(VmorchError::InvalidState(format!(
                "step '{}' was already applied with a different payload",
                step.name
            )));
        }
        Ok(())
    }

    /// Append the outcome of one control call to the step log.
    pub fn record_step(
        &mut self,
        step: &ConfigurationStep,
        result: Result<u16, &StepFailure>,
        elapsed: Duration,
    ) {
        let (outcome, status, error) = match result {
            Ok(status) => (StepOutcome::Succeeded, Some(status), None),
            Err(failure) => {
                let status = match failure {
                    StepFailure::Status { status, .. } => Some(*status),
                    _ => None,
                };
                (StepOutcome::Failed, status, Some(failure.to_string()))
            }
        };

        self.steps.push(AppliedStep {
            name: step.name.clone(),
            resource: step.resource.clone(),
            payload: step.payload.clone(),
            outcome,
            status,
            error,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    pub fn has_succeeded(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name == name && s.succeeded())
    }

    /// Names of attempted steps, in order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::plan_steps;
    use crate::spec::InstanceSpec;

    fn configuring() -> InstanceState {
        let mut state = InstanceState::new();
        state.apply_event(LifecycleEvent::BeginConfigure).unwrap();
        state
    }

    fn record_ok(state: &mut InstanceState, step: &ConfigurationStep) {
        state.record_step(step, Ok(204), Duration::from_millis(1));
    }

    #[test]
    fn test_configuration_complete_requires_mandatory_steps() {
        let mut state = configuring();
        let steps = plan_steps(&InstanceSpec::new("/k", "/r", 1, 128)).unwrap();

        record_ok(&mut state, &steps[0]);
        record_ok(&mut state, &steps[1]);
        let err = state
            .apply_event(LifecycleEvent::ConfigurationComplete)
            .unwrap_err();
        assert!(matches!(err, VmorchError::InvalidTransition { .. }));
        assert_eq!(state.phase(), InstancePhase::Configuring);

        record_ok(&mut state, &steps[2]);
        assert_eq!(
            state.apply_event(LifecycleEvent::ConfigurationComplete).unwrap(),
            InstancePhase::Ready
        );
    }

    #[test]
    fn test_failed_mandatory_step_does_not_count() {
        let mut state = configuring();
        let steps = plan_steps(&InstanceSpec::new("/k", "/r", 1, 128)).unwrap();
        state.record_step(
            &steps[0],
            Err(&StepFailure::Status {
                status: 400,
                fault: None,
            }),
            Duration::ZERO,
        );
        assert!(!state.has_succeeded("boot-source"));
        assert_eq!(state.steps()[0].status, Some(400));
        assert_eq!(state.steps()[0].outcome, StepOutcome::Failed);
    }

    #[test]
    fn test_conflicting_reapply_rejected() {
        let mut state = configuring();
        let first = plan_steps(&InstanceSpec::new("/k", "/r", 1, 128)).unwrap();
        record_ok(&mut state, &first[2]);

        state.check_step(&first[2]).unwrap();

        let other = plan_steps(&InstanceSpec::new("/k", "/r", 2, 128)).unwrap();
        let err = state.check_step(&other[2]).unwrap_err();
        assert!(err.to_string().contains("different payload"));
    }

    #[test]
    fn test_steps_require_matching_phase() {
        let state = InstanceState::new();
        let steps = plan_steps(&InstanceSpec::new("/k", "/r", 1, 128)).unwrap();
        assert!(state.check_step(&steps[0]).is_err());

        let update = ConfigurationStep::update(
            "balloon-update",
            "/balloon",
            &serde_json::json!({"amount_mib": 1}),
        )
        .unwrap();
        assert!(configuring().check_step(&update).is_err());
    }

    #[test]
    fn test_fail_records_cause_and_keeps_terminal() {
        let mut state = configuring();
        assert_eq!(state.fail(&VmorchError::Cancelled), InstancePhase::Failed);
        assert_eq!(state.last_error(), Some("orchestration cancelled"));

        let err = state.apply_event(LifecycleEvent::Fail).unwrap_err();
        assert!(matches!(err, VmorchError::InvalidTransition { .. }));
        assert_eq!(state.fail(&VmorchError::Internal("x".into())), InstancePhase::Failed);
    }

    #[test]
    fn test_append_error_keeps_cause_first() {
        let mut state = InstanceState::new();
        state.append_error("tap0: gone");
        assert_eq!(state.last_error(), Some("tap0: gone"));

        state.fail(&VmorchError::Cancelled);
        state.append_error("network release failed: tap0: gone");
        assert_eq!(
            state.last_error(),
            Some("orchestration cancelled; network release failed: tap0: gone")
        );
    }

    #[test]
    fn test_outcome_names() {
        for outcome in [StepOutcome::Succeeded, StepOutcome::Failed] {
            assert_eq!(StepOutcome::parse(outcome.as_str()), Some(outcome));
        }
    }
}
