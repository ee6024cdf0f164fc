//! Public identifiers and summaries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use vmorch_shared::{InstancePhase, Transport};

use crate::instance::InstanceConfig;
use crate::lifecycle::InstanceState;

/// ULID string, 26 characters, sortable by creation time.
pub type InstanceId = String;

pub fn generate_instance_id() -> InstanceId {
    ulid::Ulid::new().to_string()
}

/// Point-in-time summary of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub name: Option<String>,
    pub phase: InstancePhase,
    pub transport: Transport,
    pub last_error: Option<String>,
    /// Attempted configuration steps, failed ones included.
    pub steps_attempted: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceInfo {
    pub(crate) fn new(config: &InstanceConfig, state: &InstanceState) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            phase: state.phase(),
            transport: config.transport.clone(),
            last_error: state.last_error().map(str::to_string),
            steps_attempted: state.steps().len(),
            created_at: config.created_at,
            updated_at: state.updated_at(),
        }
    }
}
