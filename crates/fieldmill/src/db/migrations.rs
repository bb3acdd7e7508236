//! Schema versioning for the job database.
//!
//! Applied versions are recorded in `_migrations`. Each pending step runs in
//! its own transaction together with its bookkeeping row.

use rusqlite::{params, Connection};

use super::error::DatabaseError;

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[Step {
    version: 1,
    name: "create_extraction_jobs",
    sql: include_str!("sql/001_create_extraction_jobs.sql"),
}];

fn latest_version() -> u32 {
    STEPS.last().map(|s| s.version).unwrap_or(0)
}

fn applied_version(conn: &Connection) -> Result<u32, DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}

/// Brings the schema up to the latest version this build knows and returns
/// that version.
///
/// A database written by a newer build is refused rather than modified.
pub fn run_all(conn: &Connection) -> Result<u32, DatabaseError> {
    let applied = applied_version(conn)?;
    let latest = latest_version();
    if applied > latest {
        return Err(DatabaseError::NewerSchema {
            found: applied,
            supported: latest,
        });
    }

    for step in STEPS.iter().filter(|s| s.version > applied) {
        log::info!("Applying job database migration v{} ({})", step.version, step.name);

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(step.sql)
            .map_err(|e| DatabaseError::Migration {
                version: step.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![step.version, step.name],
        )?;
        tx.commit()?;
    }

    Ok(latest)
}
