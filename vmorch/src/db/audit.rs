//! Persistent audit trail of instances and their configuration steps.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use vmorch_shared::errors::{VmorchError, VmorchResult};
use vmorch_shared::lifecycle::InstancePhase;
use vmorch_shared::transport::Transport;

use super::{Database, db_err};
use crate::lifecycle::{AppliedStep, InstanceState, StepOutcome};
use crate::spec::InstanceSpec;

/// One instance as stored in the audit database.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: Option<String>,
    pub spec: InstanceSpec,
    pub transport: Transport,
    pub phase: InstancePhase,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<AppliedStep>,
}

impl InstanceRecord {
    pub fn state(&self) -> InstanceState {
        InstanceState::restore(
            self.phase,
            self.steps.clone(),
            self.last_error.clone(),
            self.updated_at,
        )
    }
}

#[derive(Clone)]
pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new instance with its current state.
    pub fn insert(&self, record: &InstanceRecord) -> VmorchResult<()> {
        let spec = serde_json::to_string(&record.spec)?;
        let transport = serde_json::to_string(&record.transport)?;

        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO instances
                (id, name, spec, transport, phase, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.name,
                spec,
                transport,
                record.phase.as_str(),
                record.last_error,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        ))?;
        Ok(())
    }

    /// Replace phase, last error and step log of an instance.
    pub fn save_state(&self, id: &str, state: &InstanceState) -> VmorchResult<()> {
        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;

        let updated = db_err!(tx.execute(
            "UPDATE instances SET phase = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id,
                state.phase().as_str(),
                state.last_error(),
                state.updated_at().to_rfc3339(),
            ],
        ))?;
        if updated == 0 {
            return Err(VmorchError::NotFound(format!("instance {}", id)));
        }

        db_err!(tx.execute("DELETE FROM instance_steps WHERE instance_id = ?1", [id]))?;
        for (seq, step) in state.steps().iter().enumerate() {
            db_err!(tx.execute(
                "INSERT INTO instance_steps
                    (instance_id, seq, name, resource, payload, outcome, status, error,
                     duration_ms, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    seq as i64,
                    step.name,
                    step.resource,
                    step.payload.to_string(),
                    step.outcome.as_str(),
                    step.status,
                    step.error,
                    i64::try_from(step.duration_ms).unwrap_or(i64::MAX),
                    step.at.to_rfc3339(),
                ],
            ))?;
        }

        db_err!(tx.commit())
    }

    pub fn load(&self, id: &str) -> VmorchResult<Option<InstanceRecord>> {
        let record = {
            let conn = self.db.conn();
            db_err!(
                conn.query_row(
                    "SELECT id, name, spec, transport, phase, last_error, created_at, updated_at
                     FROM instances WHERE id = ?1",
                    [id],
                    RawInstance::from_row,
                )
                .optional()
            )?
        };

        record.map(|raw| self.hydrate(raw)).transpose()
    }

    /// All instances, newest first.
    pub fn list(&self) -> VmorchResult<Vec<InstanceRecord>> {
        let raws = {
            let conn = self.db.conn();
            let mut stmt = db_err!(conn.prepare(
                "SELECT id, name, spec, transport, phase, last_error, created_at, updated_at
                 FROM instances ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = db_err!(stmt.query_map([], RawInstance::from_row))?;
            db_err!(rows.collect::<Result<Vec<_>, _>>())?
        };

        raws.into_iter().map(|raw| self.hydrate(raw)).collect()
    }

    pub fn delete(&self, id: &str) -> VmorchResult<bool> {
        let conn = self.db.conn();
        let removed = db_err!(conn.execute("DELETE FROM instances WHERE id = ?1", [id]))?;
        Ok(removed > 0)
    }

    fn load_steps(&self, id: &str) -> VmorchResult<Vec<AppliedStep>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT name, resource, payload, outcome, status, error, duration_ms, at
             FROM instance_steps WHERE instance_id = ?1 ORDER BY seq"
        ))?;
        let rows = db_err!(stmt.query_map([id], RawStep::from_row))?;
        let raws = db_err!(rows.collect::<Result<Vec<_>, _>>())?;
        raws.into_iter().map(RawStep::into_step).collect()
    }

    fn hydrate(&self, raw: RawInstance) -> VmorchResult<InstanceRecord> {
        let steps = self.load_steps(&raw.id)?;
        Ok(InstanceRecord {
            spec: serde_json::from_str(&raw.spec)?,
            transport: serde_json::from_str(&raw.transport)?,
            phase: InstancePhase::parse(&raw.phase).ok_or_else(|| {
                VmorchError::Database(format!("unknown phase '{}' for {}", raw.phase, raw.id))
            })?,
            created_at: parse_time(&raw.created_at)?,
            updated_at: parse_time(&raw.updated_at)?,
            id: raw.id,
            name: raw.name,
            last_error: raw.last_error,
            steps,
        })
    }
}

struct RawInstance {
    id: String,
    name: Option<String>,
    spec: String,
    transport: String,
    phase: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawInstance {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            spec: row.get(2)?,
            transport: row.get(3)?,
            phase: row.get(4)?,
            last_error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

struct RawStep {
    name: String,
    resource: String,
    payload: String,
    outcome: String,
    status: Option<u16>,
    error: Option<String>,
    duration_ms: i64,
    at: String,
}

impl RawStep {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            resource: row.get(1)?,
            payload: row.get(2)?,
            outcome: row.get(3)?,
            status: row.get(4)?,
            error: row.get(5)?,
            duration_ms: row.get(6)?,
            at: row.get(7)?,
        })
    }

    fn into_step(self) -> VmorchResult<AppliedStep> {
        Ok(AppliedStep {
            payload: serde_json::from_str(&self.payload)?,
            outcome: StepOutcome::parse(&self.outcome).ok_or_else(|| {
                VmorchError::Database(format!("unknown step outcome '{}'", self.outcome))
            })?,
            duration_ms: u64::try_from(self.duration_ms).unwrap_or_default(),
            at: parse_time(&self.at)?,
            name: self.name,
            resource: self.resource,
            status: self.status,
            error: self.error,
        })
    }
}

fn parse_time(s: &str) -> VmorchResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VmorchError::Database(format!("invalid timestamp '{}': {}", s, e)))
}
