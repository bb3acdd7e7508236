//! Row-level access to the `extraction_jobs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database. List-valued columns hold JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub documents: String,
    pub context: String,
    pub fields: String,
    pub status: String,
    pub total_files: i64,
    pub files_processed: i64,
    pub error_count: i64,
    pub error_message: Option<String>,
    pub result: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            documents: row.get("documents")?,
            context: row.get("context")?,
            fields: row.get("fields")?,
            status: row.get("status")?,
            total_files: row.get("total_files")?,
            files_processed: row.get("files_processed")?,
            error_count: row.get("error_count")?,
            error_message: row.get("error_message")?,
            result: row.get("result")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO extraction_jobs (id, documents, context, fields, status, total_files,
             files_processed, error_count, error_message, result, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.documents,
                job.context,
                job.fields,
                job.status,
                job.total_files,
                job.files_processed,
                job.error_count,
                job.error_message,
                job.result,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Updates the mutable columns of a job. Returns the number of rows changed.
pub fn update(db: &Database, job: &JobRow) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE extraction_jobs SET status=?2, total_files=?3, files_processed=?4,
             error_count=?5, error_message=?6, result=?7, updated_at=?8
             WHERE id=?1",
            params![
                job.id,
                job.status,
                job.total_files,
                job.files_processed,
                job.error_count,
                job.error_message,
                job.result,
                job.updated_at,
            ],
        )?;
        Ok(changed)
    })
}

/// Every stored job, newest first.
pub fn list_all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM extraction_jobs ORDER BY created_at DESC, id")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
