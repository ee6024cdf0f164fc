use chrono::{DateTime, Utc};
use serde::Serialize;
use vmorch_shared::Transport;

use crate::db::InstanceRecord;
use crate::lifecycle::InstanceState;
use crate::runtime::types::InstanceId;
use crate::spec::InstanceSpec;

/// Static instance configuration, fixed at creation.
///
/// Persisted once; only the `InstanceState` changes afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceConfig {
    pub id: InstanceId,
    /// Unique among the runtime's instances when set.
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub spec: InstanceSpec,
    /// Where the VMM control surface listens.
    pub transport: Transport,
}

impl InstanceConfig {
    pub(crate) fn to_record(&self, state: &InstanceState) -> InstanceRecord {
        InstanceRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            spec: self.spec.clone(),
            transport: self.transport.clone(),
            phase: state.phase(),
            last_error: state.last_error().map(str::to_string),
            created_at: self.created_at,
            updated_at: state.updated_at(),
            steps: state.steps().to_vec(),
        }
    }

    pub(crate) fn from_record(record: &InstanceRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            created_at: record.created_at,
            spec: record.spec.clone(),
            transport: record.transport.clone(),
        }
    }
}
