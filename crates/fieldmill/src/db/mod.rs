//! SQLite persistence for job metadata.
//!
//! The job store writes every state transition through a [`Database`], so a
//! handle is only handed out once the schema is current.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

pub mod error;
pub mod job_repo;
pub mod migrations;

pub use error::DatabaseError;

/// How long a statement waits on a lock held by another process, such as a
/// second `fieldmill jobs` reading the same file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle on the job database. Clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    location: Option<PathBuf>,
    schema_version: u32,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.location)
            .field("schema_version", &self.schema_version)
            .finish()
    }
}

impl Database {
    /// Opens the job database at `path`, creating the file and its parent
    /// directory on first use.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DatabaseError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            log::warn!(
                "Job database {} stays in {} journal mode",
                path.display(),
                mode
            );
        }

        Self::prepare(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?, None)
    }

    fn prepare(conn: Connection, location: Option<PathBuf>) -> Result<Self, DatabaseError> {
        let schema_version = migrations::run_all(&conn)?;
        match &location {
            Some(path) => log::info!(
                "Job database opened at {} (schema v{})",
                path.display(),
                schema_version
            ),
            None => log::debug!("In-memory job database ready (schema v{})", schema_version),
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
            schema_version,
        })
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            log::warn!("Job database lock was poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Runs `f` with exclusive use of the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        f(&self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_count(db: &Database) -> u32 {
        db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM extraction_jobs", [], |r| r.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn test_in_memory_is_migrated() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version(), 1);
        assert_eq!(job_count(&db), 0);
    }

    #[test]
    fn test_file_database_creates_parent_and_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("jobs.db");
        let db = Database::open(&path).unwrap();

        assert!(path.exists());
        assert!(format!("{:?}", db).contains("jobs.db"));
        let mode: String = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_reopen_sees_committed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO extraction_jobs (id, documents, fields, created_at, updated_at)
                     VALUES ('t1', '[]', '[]', '2026-01-01', '2026-01-01')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        }

        let reopened = Database::open(&path).unwrap();
        assert_eq!(reopened.schema_version(), 1);
        assert_eq!(job_count(&reopened), 1);
    }

    #[test]
    fn test_refuses_file_from_newer_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        {
            let conn = Connection::open(&path).unwrap();
            migrations::run_all(&conn).unwrap();
            conn.execute(
                "INSERT INTO _migrations (version, name) VALUES (7, 'later')",
                [],
            )
            .unwrap();
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, DatabaseError::NewerSchema { found: 7, .. }));
    }

    #[test]
    fn test_survives_poisoned_lock() {
        let db = Database::open_in_memory().unwrap();
        let shared = db.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.conn.lock().unwrap();
            panic!("poison the connection lock");
        })
        .join();

        assert_eq!(job_count(&db), 0);
    }
}
