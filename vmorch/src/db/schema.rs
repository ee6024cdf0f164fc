//! SQLite schema.

pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// One row per instance. The spec is stored as a JSON blob; phase and
/// name are columns so they can be queried.
const INSTANCES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT UNIQUE,
    spec TEXT NOT NULL,
    transport TEXT NOT NULL,
    phase TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instances_phase ON instances(phase);
";

/// Attempted configuration steps, in order.
const STEPS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS instance_steps (
    instance_id TEXT NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    name TEXT NOT NULL,
    resource TEXT NOT NULL,
    payload TEXT NOT NULL,
    outcome TEXT NOT NULL,
    status INTEGER,
    error TEXT,
    duration_ms INTEGER NOT NULL,
    at TEXT NOT NULL,
    PRIMARY KEY (instance_id, seq)
);
";

pub fn all_schemas() -> [&'static str; 3] {
    [SCHEMA_VERSION_TABLE, INSTANCES_TABLE, STEPS_TABLE]
}
