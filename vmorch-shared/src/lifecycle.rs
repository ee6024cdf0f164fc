//! Instance lifecycle vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of one VM instance.
///
/// ```text
/// Unconfigured → Configuring → Ready → Running → {Stopped, Failed}
/// ```
///
/// `Failed` is reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    Unconfigured,
    Configuring,
    Ready,
    Running,
    Stopped,
    Failed,
}

impl InstancePhase {
    pub const ALL: [InstancePhase; 6] = [
        InstancePhase::Unconfigured,
        InstancePhase::Configuring,
        InstancePhase::Ready,
        InstancePhase::Running,
        InstancePhase::Stopped,
        InstancePhase::Failed,
    ];

    /// No further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstancePhase::Stopped | InstancePhase::Failed)
    }

    /// Host resources may be held in this phase.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            InstancePhase::Configuring | InstancePhase::Ready | InstancePhase::Running
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstancePhase::Unconfigured => "unconfigured",
            InstancePhase::Configuring => "configuring",
            InstancePhase::Ready => "ready",
            InstancePhase::Running => "running",
            InstancePhase::Stopped => "stopped",
            InstancePhase::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events driving the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    BeginConfigure,
    ConfigurationComplete,
    Start,
    Stop,
    CrashDetected,
    Fail,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 6] = [
        LifecycleEvent::BeginConfigure,
        LifecycleEvent::ConfigurationComplete,
        LifecycleEvent::Start,
        LifecycleEvent::Stop,
        LifecycleEvent::CrashDetected,
        LifecycleEvent::Fail,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::BeginConfigure => "begin_configure",
            LifecycleEvent::ConfigurationComplete => "configuration_complete",
            LifecycleEvent::Start => "start",
            LifecycleEvent::Stop => "stop",
            LifecycleEvent::CrashDetected => "crash_detected",
            LifecycleEvent::Fail => "fail",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
