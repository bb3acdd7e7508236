//! Preparing a `DoneWithErrors` job for another pass over its failures.

use std::collections::BTreeSet;

use log::info;

use crate::checkpoint::record::source_file_name;
use crate::checkpoint::{CheckpointStore, RecordSchema};
use crate::error::{JobError, Result};
use crate::job::{JobId, JobStatus, JobStore};

/// Result of preparing a retry, returned to the caller right away.
#[derive(Debug, Clone)]
pub struct RetryTicket {
    pub job_id: JobId,
    /// The checkpoint log after errored rows were removed.
    pub cleaned_csv: String,
    /// Documents whose error rows were removed.
    pub removed: BTreeSet<String>,
    pub processed_before: usize,
    pub errors_before: usize,
    /// Documents the next run still has to process.
    pub pending: usize,
}

impl RetryTicket {
    pub fn needs_run(&self) -> bool {
        self.pending > 0
    }
}

/// Removes errored records from the job's log and moves the job back to
/// `Running` with its counters reset to the surviving records.
///
/// When no document is left to process the job is completed on the spot
/// from the cleaned log.
pub fn prepare_retry(
    jobs: &JobStore,
    checkpoints: &CheckpointStore,
    job_id: JobId,
) -> Result<RetryTicket> {
    let job = jobs.require(&job_id)?;
    if job.status() != JobStatus::DoneWithErrors {
        return Err(JobError::NotRetryable {
            job_id,
            status: job.status(),
        }
        .into());
    }

    let processed_before = job.files_processed();
    let errors_before = job.error_count();

    let mut log = checkpoints.open(job_id, RecordSchema::from_fields(job.fields()))?;
    let removed = log.remove_errored()?;
    let job = jobs.update(&job_id, |j| j.restart_for_retry(log.len()))?;

    let pending = job
        .documents()
        .iter()
        .filter(|d| !log.contains(&source_file_name(d)))
        .count();

    if pending == 0 {
        info!(
            "Job {}: no documents left to reprocess, settling from the log",
            job_id
        );
        let records = log.read_all()?;
        jobs.update(&job_id, |j| j.complete(records))?;
    } else {
        info!(
            "Job {} prepared for retry: {} records kept, {} errors removed",
            job_id,
            log.len(),
            removed.len()
        );
    }

    Ok(RetryTicket {
        job_id,
        cleaned_csv: log.to_csv(),
        removed,
        processed_before,
        errors_before,
        pending,
    })
}
