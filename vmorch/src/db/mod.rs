//! SQLite audit database.
//!
//! Instance specs are written once at registration. Phase, last error and
//! the step log are rewritten whenever the instance state changes.

mod audit;
mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use vmorch_shared::errors::{VmorchError, VmorchResult};

pub use audit::{AuditStore, InstanceRecord};

/// Convert rusqlite errors to `VmorchError::Database`.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| VmorchError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

/// SQLite database handle, shared through `parking_lot::Mutex`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the audit database at `db_path`, creating it on first use.
    ///
    /// Fails with [`VmorchError::Database`] if the file was written by a
    /// newer vmorch.
    pub fn open(db_path: &Path) -> VmorchResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;
        db_err!(conn.execute_batch(CONNECTION_PRAGMAS))?;
        ensure_schema(&conn)?;

        tracing::debug!(path = %db_path.display(), "Audit database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Applied to every connection.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

fn ensure_schema(conn: &Connection) -> VmorchResult<()> {
    for ddl in schema::all_schemas() {
        db_err!(conn.execute_batch(ddl))?;
    }

    match stored_version(conn)? {
        None => {
            db_err!(conn.execute(
                "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                rusqlite::params![schema::SCHEMA_VERSION, Utc::now().to_rfc3339()],
            ))?;
            tracing::info!(version = schema::SCHEMA_VERSION, "Created audit schema");
            Ok(())
        }
        Some(found) if found > schema::SCHEMA_VERSION => Err(VmorchError::Database(format!(
            "audit schema version {} is newer than supported version {}",
            found,
            schema::SCHEMA_VERSION
        ))),
        Some(found) => {
            if found < schema::SCHEMA_VERSION {
                tracing::warn!(
                    found,
                    supported = schema::SCHEMA_VERSION,
                    "Audit schema is older than this build; opening as-is"
                );
            }
            Ok(())
        }
    }
}

fn stored_version(conn: &Connection) -> VmorchResult<Option<i32>> {
    db_err!(
        conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_and_is_reopenable() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("db").join("vmorch.db");
        drop(Database::open(&db_path).unwrap());

        let db = Database::open(&db_path).unwrap();
        assert_eq!(
            stored_version(&db.conn()).unwrap(),
            Some(schema::SCHEMA_VERSION)
        );
    }

    #[test]
    fn test_newer_schema_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("vmorch.db");
        {
            let db = Database::open(&db_path).unwrap();
            db.conn()
                .execute("UPDATE schema_version SET version = 99 WHERE id = 1", [])
                .unwrap();
        }
        assert!(matches!(
            Database::open(&db_path),
            Err(VmorchError::Database(_))
        ));
    }
}
