//! SQLite persistence.
//!
//! Rows keep the full record as a JSON blob next to the few columns that
//! queries filter on, so the record can grow without schema changes.

mod schema;
mod volumes;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use voldrive_shared::errors::{VoldriveError, VoldriveResult};

pub use volumes::VolumeStore;

/// Convert rusqlite errors to VoldriveError.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| VoldriveError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

/// SQLite database handle, shared behind a `parking_lot::Mutex`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database.
    pub fn open(db_path: &Path) -> VoldriveResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;

        // WAL for concurrent readers (the executor process may read while
        // the driver writes); the busy timeout covers that overlap.
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=10000;
            "
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(conn: &Connection) -> VoldriveResult<()> {
        for sql in schema::all_schemas() {
            db_err!(conn.execute_batch(sql))?;
        }

        let current_version: Option<i32> = db_err!(
            conn.query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
        )?;

        match current_version {
            None => {
                let now = Utc::now().to_rfc3339();
                db_err!(conn.execute(
                    "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    rusqlite::params![schema::SCHEMA_VERSION, now],
                ))?;
                tracing::debug!(version = schema::SCHEMA_VERSION, "Initialized volume database schema");
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(VoldriveError::Database(format!(
                    "database schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_db_open_twice() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/vfs.db");
        drop(Database::open(&db_path).unwrap());
        Database::open(&db_path).unwrap();
    }

    #[test]
    fn test_newer_schema_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("vfs.db");
        {
            let db = Database::open(&db_path).unwrap();
            db.conn()
                .execute("UPDATE schema_version SET version = 999 WHERE id = 1", [])
                .unwrap();
        }
        assert!(matches!(
            Database::open(&db_path),
            Err(VoldriveError::Database(_))
        ));
    }
}
