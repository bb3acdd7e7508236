use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cannot create database directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job database migration v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    #[error("Job database is at schema v{found}, this build supports up to v{supported}")]
    NewerSchema { found: u32, supported: u32 },

    /// A stored row could not be turned back into a job.
    #[error("Stored job {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}
