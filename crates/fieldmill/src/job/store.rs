//! Job store with optional write-through database storage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checkpoint::record::CheckpointRecord;
use crate::db::job_repo::{self, JobRow};
use crate::db::{Database, DatabaseError};
use crate::error::{JobError, Result};
use crate::job::{FieldSpec, Job, JobId, JobStatus};

fn parse_timestamp(s: &str, job_id: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("Job {}: failed to parse timestamp '{}': {}", job_id, s, e);
            Utc::now()
        })
}

fn to_json<T: Serialize>(value: &T, id: &JobId) -> std::result::Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn from_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    id: &str,
    column: &str,
) -> std::result::Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Corrupt {
        id: id.to_string(),
        reason: format!("column '{}': {}", column, e),
    })
}

fn count(value: i64, id: &str, column: &str) -> std::result::Result<usize, DatabaseError> {
    usize::try_from(value).map_err(|_| DatabaseError::Corrupt {
        id: id.to_string(),
        reason: format!("column '{}' is negative", column),
    })
}

/// Converts a job into its database row.
pub fn job_to_row(job: &Job) -> std::result::Result<JobRow, DatabaseError> {
    let result = match job.result() {
        Some(records) => Some(to_json(&records, &job.id())?),
        None => None,
    };
    Ok(JobRow {
        id: job.id().to_string(),
        documents: to_json(&job.documents(), &job.id())?,
        context: job.context().to_string(),
        fields: to_json(&job.fields(), &job.id())?,
        status: job.status().as_str().to_string(),
        total_files: job.total_files() as i64,
        files_processed: job.files_processed() as i64,
        error_count: job.error_count() as i64,
        error_message: job.error_message().map(str::to_string),
        result,
        created_at: job.created_at().to_rfc3339(),
        updated_at: job.updated_at().to_rfc3339(),
    })
}

/// Rebuilds a job from its database row.
pub fn job_from_row(row: &JobRow) -> std::result::Result<Job, DatabaseError> {
    let id = row.id.parse::<JobId>().map_err(|e| DatabaseError::Corrupt {
        id: row.id.clone(),
        reason: e.to_string(),
    })?;
    let status = JobStatus::parse(&row.status).ok_or_else(|| DatabaseError::Corrupt {
        id: row.id.clone(),
        reason: format!("unknown status '{}'", row.status),
    })?;
    let documents: Vec<PathBuf> = from_json(&row.documents, &row.id, "documents")?;
    let fields: Vec<FieldSpec> = from_json(&row.fields, &row.id, "fields")?;
    let result: Option<Vec<CheckpointRecord>> = match row.result {
        Some(ref raw) => Some(from_json(raw, &row.id, "result")?),
        None => None,
    };

    Ok(Job {
        id,
        documents,
        context: row.context.clone(),
        fields,
        status,
        total_files: count(row.total_files, &row.id, "total_files")?,
        files_processed: count(row.files_processed, &row.id, "files_processed")?,
        error_count: count(row.error_count, &row.id, "error_count")?,
        error_message: row.error_message.clone(),
        result,
        created_at: parse_timestamp(&row.created_at, &row.id),
        updated_at: parse_timestamp(&row.updated_at, &row.id),
    })
}

/// Number of jobs per status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub done_with_errors: usize,
    pub failed: usize,
}

/// Concurrency-safe keyed storage for jobs.
///
/// The in-memory cache is the read path. When a database is attached every
/// write goes through to it while the cache write lock is held, so a reader
/// never observes a job that is not yet durable.
pub struct JobStore {
    db: RwLock<Option<Database>>,
    cache: RwLock<HashMap<JobId, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            db: RwLock::new(None),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a store backed by `db`.
    pub fn with_database(db: Database) -> Self {
        let store = Self::new();
        store.set_database(db);
        store
    }

    pub fn set_database(&self, db: Database) {
        let mut guard = match self.db.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = Some(db);
    }

    /// Gets a cloned database handle if available.
    pub fn get_database(&self) -> Option<Database> {
        let guard = match self.db.read() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.clone()
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Inserts a new job. Fails if the id is already present.
    pub fn insert(&self, job: Job) -> Result<()> {
        let mut cache = self.write_cache();
        if cache.contains_key(&job.id()) {
            return Err(JobError::AlreadyExists(job.id()).into());
        }
        if let Some(db) = self.get_database() {
            job_repo::insert(&db, &job_to_row(&job)?)?;
        }
        cache.insert(job.id(), job);
        Ok(())
    }

    /// Returns a snapshot of a job.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.read_cache().get(id).cloned()
    }

    /// Returns a snapshot of a job, or `JobError::NotFound`.
    pub fn require(&self, id: &JobId) -> std::result::Result<Job, JobError> {
        self.get(id).ok_or(JobError::NotFound(*id))
    }

    /// Applies `mutate` to a job under the store's write lock.
    ///
    /// The mutation runs on a copy; the cache and database only see it when
    /// both `mutate` and the database write succeed. Returns the updated job.
    pub fn update<F>(&self, id: &JobId, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> std::result::Result<(), JobError>,
    {
        let mut cache = self.write_cache();
        let current = cache.get(id).ok_or(JobError::NotFound(*id))?;
        let mut next = current.clone();
        mutate(&mut next)?;

        if let Some(db) = self.get_database() {
            job_repo::update(&db, &job_to_row(&next)?)?;
        }
        cache.insert(*id, next.clone());
        Ok(next)
    }

    /// Returns all jobs, newest first.
    pub fn get_all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.read_cache().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        jobs
    }

    pub fn find_by_status(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read_cache()
            .values()
            .filter(|j| j.status() == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at().cmp(&b.created_at()));
        jobs
    }

    pub fn counts(&self) -> StatusCounts {
        let cache = self.read_cache();
        let mut counts = StatusCounts::default();
        for job in cache.values() {
            match job.status() {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::DoneWithErrors => counts.done_with_errors += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Loads every stored job into the cache. Corrupt rows are skipped with
    /// a warning. Returns the number of jobs loaded.
    pub fn load_from_database(&self) -> Result<usize> {
        let db = match self.get_database() {
            Some(db) => db,
            None => return Ok(0),
        };

        let rows = job_repo::list_all(&db)?;

        let mut loaded = 0;
        let mut cache = self.write_cache();
        for row in &rows {
            match job_from_row(row) {
                Ok(job) => {
                    cache.insert(job.id(), job);
                    loaded += 1;
                }
                Err(e) => log::warn!("Skipping stored job {}: {}", row.id, e),
            }
        }

        log::info!("Loaded {} jobs from database into cache", loaded);
        Ok(loaded)
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}
