//! The job entity and its state machine.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::record::{source_file_name, CheckpointRecord};
use crate::error::JobError;
use crate::job::FieldSpec;

/// Opaque job identifier, generated at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Job lifecycle status.
///
/// `Pending -> Running -> {Done, DoneWithErrors, Failed}`, and
/// `DoneWithErrors -> Running` through the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    DoneWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::DoneWithErrors => "done_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "done_with_errors" => Some(JobStatus::DoneWithErrors),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Done or done with errors: a result set exists.
    pub fn is_settled(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::DoneWithErrors)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_settled() || *self == JobStatus::Failed
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked unit of work extracting fields from a document set.
///
/// Invariants held by every mutator:
/// - `files_processed <= total_files` and `error_count <= files_processed`
/// - `result` is set iff the status is settled
/// - `error_message` is set iff the status is `Failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) documents: Vec<PathBuf>,
    pub(crate) context: String,
    pub(crate) fields: Vec<FieldSpec>,
    pub(crate) status: JobStatus,
    pub(crate) total_files: usize,
    pub(crate) files_processed: usize,
    pub(crate) error_count: usize,
    pub(crate) error_message: Option<String>,
    pub(crate) result: Option<Vec<CheckpointRecord>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a pending job.
    ///
    /// Documents are recorded under their file names, so two documents
    /// sharing a file name are rejected.
    pub fn new(
        documents: Vec<PathBuf>,
        context: &str,
        fields: Vec<FieldSpec>,
    ) -> Result<Self, JobError> {
        if documents.is_empty() {
            return Err(JobError::Validation(
                "at least one document is required".to_string(),
            ));
        }
        if fields.is_empty() {
            return Err(JobError::Validation(
                "at least one field is required".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for doc in &documents {
            let name = source_file_name(doc);
            if !seen.insert(name.clone()) {
                return Err(JobError::Validation(format!(
                    "duplicate document name '{}'",
                    name
                )));
            }
        }

        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            total_files: documents.len(),
            documents,
            context: context.to_string(),
            fields,
            status: JobStatus::Pending,
            files_processed: 0,
            error_count: 0,
            error_message: None,
            result: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn documents(&self) -> &[PathBuf] {
        &self.documents
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn total_files(&self) -> usize {
        self.total_files
    }

    pub fn files_processed(&self) -> usize {
        self.files_processed
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn result(&self) -> Option<&[CheckpointRecord]> {
        self.result.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn start(&mut self) -> Result<(), JobError> {
        self.guard(JobStatus::Pending, "start")?;
        self.status = JobStatus::Running;
        self.touch();
        Ok(())
    }

    /// Settles a running job with its full checkpoint log.
    ///
    /// The status is `Done` when no record carries an error, otherwise
    /// `DoneWithErrors`. Counters are synchronized with the records.
    pub fn complete(&mut self, records: Vec<CheckpointRecord>) -> Result<(), JobError> {
        self.guard(JobStatus::Running, "complete")?;
        let errors = records.iter().filter(|r| r.is_error()).count();
        self.check_progress(records.len(), errors)?;

        self.files_processed = records.len();
        self.error_count = errors;
        self.status = if errors == 0 {
            JobStatus::Done
        } else {
            JobStatus::DoneWithErrors
        };
        self.result = Some(records);
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, message: &str) -> Result<(), JobError> {
        self.guard(JobStatus::Running, "fail")?;
        self.status = JobStatus::Failed;
        self.error_message = Some(message.to_string());
        self.result = None;
        self.touch();
        Ok(())
    }

    /// Re-enters `Running` after errored records were removed from the log.
    pub fn restart_for_retry(&mut self, processed_count: usize) -> Result<(), JobError> {
        self.guard(JobStatus::DoneWithErrors, "retry")?;
        self.check_progress(processed_count, 0)?;
        self.status = JobStatus::Running;
        self.files_processed = processed_count;
        self.error_count = 0;
        self.result = None;
        self.touch();
        Ok(())
    }

    /// Records progress without changing status. `errors` of `None` keeps
    /// the current error count.
    pub fn update_progress(
        &mut self,
        processed: usize,
        errors: Option<usize>,
    ) -> Result<(), JobError> {
        let errors = errors.unwrap_or(self.error_count);
        self.check_progress(processed, errors)?;
        self.files_processed = processed;
        self.error_count = errors;
        self.touch();
        Ok(())
    }

    fn guard(&self, expected: JobStatus, action: &'static str) -> Result<(), JobError> {
        if self.status != expected {
            return Err(JobError::IllegalTransition {
                from: self.status,
                action,
            });
        }
        Ok(())
    }

    fn check_progress(&self, processed: usize, errors: usize) -> Result<(), JobError> {
        if processed > self.total_files || errors > processed {
            return Err(JobError::ProgressOutOfRange {
                files_processed: processed,
                error_count: errors,
                total_files: self.total_files,
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
