//! Error taxonomy for vmorch.
//!
//! The four domain families map onto the orchestration phases:
//! - `Validation` / `ValidationErrors`: bad input, nothing has been attempted
//! - `Sequencer`: a configuration step was rejected or unreachable
//! - `InvalidTransition`: lifecycle misuse by the caller
//! - `NetworkResource`: host-side tap/NAT setup or teardown failed

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::{InstancePhase, LifecycleEvent};

/// A single rejected field of an instance spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Why a single control-surface call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    /// The control endpoint could not be reached (refused, missing socket, reset).
    #[error("connection failed: {0}")]
    Connect(String),

    /// The call did not complete within the configured bound.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The VMM answered with a non-2xx status.
    #[error("{}", fmt_status(*.status, .fault.as_deref()))]
    Status { status: u16, fault: Option<String> },

    /// The VMM answered but the body could not be understood.
    #[error("malformed response body: {0}")]
    MalformedBody(String),
}

fn fmt_status(status: u16, fault: Option<&str>) -> String {
    match fault {
        Some(fault) => format!("VMM returned status {status}: {fault}"),
        None => format!("VMM returned status {status}"),
    }
}

fn fmt_violations(violations: &[FieldViolation]) -> String {
    let joined = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} invalid field(s): {}", violations.len(), joined)
}

#[derive(Debug, Error)]
pub enum VmorchError {
    /// First violated field of an instance spec.
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Every violated field (collect-all validation mode).
    #[error("{}", fmt_violations(.0))]
    ValidationErrors(Vec<FieldViolation>),

    /// A configuration step was rejected or could not be delivered.
    #[error("configuration step '{step}' failed: {cause}")]
    Sequencer { step: String, cause: StepFailure },

    /// The lifecycle event is not allowed in the current phase.
    #[error("invalid transition: cannot {attempted} while {from}")]
    InvalidTransition {
        from: InstancePhase,
        attempted: LifecycleEvent,
    },

    /// Host tap device or NAT rule management failed.
    #[error("network resource error: {0}")]
    NetworkResource(String),

    /// The orchestration was aborted by the operator.
    #[error("orchestration cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// VMM process management failed.
    #[error("process error: {0}")]
    Process(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmorchError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for both validation variants.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::ValidationErrors(_))
    }

    /// Name of the field reported first by a validation error.
    pub fn invalid_field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            Self::ValidationErrors(violations) => violations.first().map(|v| v.field.as_str()),
            _ => None,
        }
    }

    /// Name of the configuration step that failed, if this is a sequencer error.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::Sequencer { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<FieldViolation> for VmorchError {
    fn from(v: FieldViolation) -> Self {
        Self::Validation {
            field: v.field,
            reason: v.reason,
        }
    }
}

pub type VmorchResult<T> = Result<T, VmorchError>;
