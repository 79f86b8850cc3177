//! Volume database schema.

pub(super) const SCHEMA_VERSION: i32 = 1;

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

const VOLUMES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS volumes (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    attached_to TEXT,
    created_at TEXT NOT NULL,
    volume TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_volumes_attached_to ON volumes(attached_to);
";

pub(super) fn all_schemas() -> [&'static str; 2] {
    [SCHEMA_VERSION_TABLE, VOLUMES_TABLE]
}
