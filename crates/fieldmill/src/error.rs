use std::path::PathBuf;
use thiserror::Error;

use crate::job::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum FieldmillError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Field spec error: {0}")]
    FieldSpec(#[from] FieldSpecError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Aggregation error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Failed to resolve provider API key: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldSpecError {
    #[error("Invalid field name: {normalized:?} (from {raw:?}). Must start with a letter or underscore and contain only letters, digits, and underscores")]
    InvalidFieldName { raw: String, normalized: String },

    #[error("Description for field '{name}' is {length} characters, the limit is {limit}")]
    DescriptionTooLong {
        name: String,
        length: usize,
        limit: usize,
    },

    #[error("Field name '{name}' collides with a reserved result column")]
    ReservedName { name: String },

    #[error("Field name at index {index} is empty")]
    EmptyName { index: usize },

    #[error("Duplicate field names after normalization: {0:?}")]
    Duplicate(Vec<String>),

    #[error("At least one field is required")]
    NoFields,

    #[error("Invalid fields payload: {0}")]
    Payload(String),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("Illegal transition: cannot {action} a job in status '{from}'")]
    IllegalTransition {
        from: JobStatus,
        action: &'static str,
    },

    #[error("Progress out of range: {files_processed} processed, {error_count} errors, {total_files} total")]
    ProgressOutOfRange {
        files_processed: usize,
        error_count: usize,
        total_files: usize,
    },

    #[error("Job {job_id} is '{status}'; only jobs with done_with_errors status can be retried")]
    NotRetryable { job_id: JobId, status: JobStatus },

    #[error("Job {job_id} is '{status}' and needs resubmission, it cannot be resumed")]
    NotResumable { job_id: JobId, status: JobStatus },

    #[error("Job {job_id} is '{status}' and has no result yet")]
    NotSettled { job_id: JobId, status: JobStatus },

    #[error("Job {0} is being processed right now")]
    InFlight(JobId),

    #[error("Invalid job request: {0}")]
    Validation(String),

    #[error("Document '{}' does not exist", path.display())]
    MissingDocument { path: PathBuf },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint log for job {0} is unavailable: the job has not produced output yet")]
    LogUnavailable(JobId),

    #[error("Checkpoint I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed checkpoint row {row} in '{path}': {reason}")]
    Malformed {
        path: PathBuf,
        row: usize,
        reason: String,
    },

    #[error("Checkpoint header in '{path}' does not match the job's fields (expected {expected:?}, found {found:?})")]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to read document '{path}': {source}")]
    ReadDocument {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Document '{path}' is {size} bytes, above the inline limit of {limit} bytes")]
    DocumentTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Inference request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Inference service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Inference service returned no content")]
    EmptyResponse,

    #[error("Malformed inference output: {0}")]
    Malformed(String),

    #[error("No API key configured for the inference provider")]
    MissingApiKey,
}

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Required column '{0}' not found")]
    MissingKeyColumn(String),

    #[error("Row {row} has {found} cells, expected {expected}")]
    RowWidth {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("Input has no header row")]
    EmptyInput,

    #[error("Failed to parse input: {0}")]
    Parse(#[from] crate::checkpoint::csv::CsvError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Supervisor channel closed unexpectedly")]
    ChannelClosed,

    #[error("Job task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, FieldmillError>;
