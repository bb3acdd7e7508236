//! The operations callers use: submit jobs, query them, fetch results,
//! retry failures and aggregate.
//!
//! Every collaborator is built once here and shared by reference; the
//! supervisor owns all background runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::aggregate::{Aggregator, RecordTable};
use crate::broadcast::job_progress::{JobPhase, JobProgressBroadcaster, JobProgressEvent};
use crate::checkpoint::{CheckpointStore, RecordSchema};
use crate::config::Config;
use crate::db::Database;
use crate::error::{JobError, Result, WorkerError};
use crate::job::{parse_fields_payload, FieldSpec, Job, JobId, JobStatus, JobStore, StatusCounts};
use crate::pipeline::{BroadcastProgress, Orchestrator, RetryTicket};
use crate::provider::{GeminiProvider, InferenceProvider};
use crate::worker::JobSupervisor;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Snapshot returned by [`ExtractionService::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub files_processed: usize,
    pub total_files: usize,
    pub error_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&Job> for JobStatusReport {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id(),
            status: job.status(),
            files_processed: job.files_processed(),
            total_files: job.total_files(),
            error_count: job.error_count(),
            error_message: job.error_message().map(str::to_string),
        }
    }
}

/// Shape of a settled job's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultView {
    /// The checkpoint log, one row per document.
    Raw,
    /// One row per entity key.
    Aggregated,
}

/// Rows of the checkpoint log from a 1-based position on.
#[derive(Debug, Clone, Serialize)]
pub struct RawRowsPage {
    pub total_rows: usize,
    pub rows_returned: usize,
    pub since: Option<usize>,
    pub rows: Vec<serde_json::Value>,
}

pub struct ExtractionService {
    jobs: Arc<JobStore>,
    orchestrator: Arc<Orchestrator>,
    supervisor: JobSupervisor,
    broadcaster: JobProgressBroadcaster,
    aggregator: Aggregator,
}

impl ExtractionService {
    /// Builds the service with the Gemini provider described by `config`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.provider.resolve_api_key()?;
        let bare_fields = vec![
            config.aggregation.key_field.clone(),
            config.aggregation.name_field.clone(),
        ];
        let provider = GeminiProvider::new(&config.provider, api_key, bare_fields)?;
        Self::new(config, Arc::new(provider))
    }

    /// Builds the service around any provider. Opens the job database when
    /// one is configured and loads the jobs it holds.
    pub fn new(config: &Config, provider: Arc<dyn InferenceProvider>) -> Result<Self> {
        let jobs = match config.database_path() {
            Some(path) => {
                debug!("Opening job database at {}", path.display());
                let store = JobStore::with_database(Database::open(&path)?);
                store.load_from_database()?;
                store
            }
            None => JobStore::new(),
        };
        Ok(Self::with_store(config, Arc::new(jobs), provider))
    }

    pub fn with_store(
        config: &Config,
        jobs: Arc<JobStore>,
        provider: Arc<dyn InferenceProvider>,
    ) -> Self {
        let broadcaster = JobProgressBroadcaster::default();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&jobs),
            CheckpointStore::new(&config.data_path()),
            provider,
            Arc::new(BroadcastProgress::new(broadcaster.clone())),
        ));
        let supervisor = JobSupervisor::spawn(Arc::clone(&orchestrator), config.max_concurrent_jobs);

        Self {
            jobs,
            orchestrator,
            supervisor,
            broadcaster,
            aggregator: Aggregator::from_config(&config.aggregation),
        }
    }

    fn checkpoints(&self) -> &CheckpointStore {
        self.orchestrator.checkpoints()
    }

    /// Creates a job and queues it. Invalid requests never create a job.
    pub fn submit(
        &self,
        documents: Vec<PathBuf>,
        context: &str,
        fields: Vec<FieldSpec>,
    ) -> Result<JobId> {
        let job = Job::new(documents, context, fields)?;
        let id = job.id();
        self.jobs.insert(job.clone())?;
        info!("Job {} submitted with {} documents", id, job.total_files());

        self.broadcaster.send(JobProgressEvent::from_job(
            &job,
            JobPhase::Queued,
            "Job queued for processing",
        ));
        self.supervisor.submit(id)?;
        Ok(id)
    }

    /// Like [`submit`](Self::submit), with fields given as a JSON list of
    /// `{name, description}` objects.
    pub fn submit_payload(
        &self,
        documents: Vec<PathBuf>,
        context: &str,
        fields_json: &str,
    ) -> Result<JobId> {
        let fields = parse_fields_payload(fields_json)?;
        self.submit(documents, context, fields)
    }

    pub fn job(&self, id: &JobId) -> Result<Job> {
        Ok(self.jobs.require(id)?)
    }

    pub fn status(&self, id: &JobId) -> Result<JobStatusReport> {
        Ok(JobStatusReport::from(&self.jobs.require(id)?))
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<Job> {
        self.jobs.get_all()
    }

    pub fn counts(&self) -> StatusCounts {
        self.jobs.counts()
    }

    /// Result of a settled job, as delimited text.
    pub fn result_csv(&self, id: &JobId, view: ResultView) -> Result<String> {
        let job = self.jobs.require(id)?;
        let records = job.result().ok_or(JobError::NotSettled {
            job_id: *id,
            status: job.status(),
        })?;
        let schema = RecordSchema::from_fields(job.fields());

        match view {
            ResultView::Raw => Ok(schema.to_csv(records)),
            ResultView::Aggregated => {
                let table = RecordTable::from_records(&schema, records);
                Ok(self.aggregator.aggregate(&table)?.to_csv())
            }
        }
    }

    /// The checkpoint log as written so far. Available while the job runs.
    pub fn raw_csv(&self, id: &JobId) -> Result<String> {
        self.jobs.require(id)?;
        Ok(self.checkpoints().read_text(id)?)
    }

    /// Checkpoint rows as JSON objects, starting at the 1-based `since`.
    pub fn raw_rows(&self, id: &JobId, since: Option<usize>) -> Result<RawRowsPage> {
        let job = self.jobs.require(id)?;
        let schema = RecordSchema::from_fields(job.fields());
        let records = self.checkpoints().read_all(id, &schema)?;

        let start = since.map(|s| s.max(1) - 1).unwrap_or(0);
        let rows: Vec<serde_json::Value> = records
            .iter()
            .skip(start)
            .map(|r| schema.to_json(r))
            .collect();

        Ok(RawRowsPage {
            total_rows: records.len(),
            rows_returned: rows.len(),
            since,
            rows,
        })
    }

    /// Drops the errored rows of a `DoneWithErrors` job and queues the
    /// affected documents again. The returned ticket carries the cleaned
    /// log as it stands before reprocessing.
    pub fn retry_failed(&self, id: &JobId) -> Result<RetryTicket> {
        let ticket = self.orchestrator.prepare_retry(*id)?;
        if ticket.needs_run() {
            self.supervisor.submit(*id)?;
        }
        Ok(ticket)
    }

    /// Queues an interrupted job so it continues from its checkpoint log.
    pub fn resume(&self, id: &JobId) -> Result<()> {
        let job = self.jobs.require(id)?;
        match job.status() {
            JobStatus::Pending | JobStatus::Running => {
                if self.orchestrator.is_in_flight(id) {
                    debug!("Job {} is already running, resume is a no-op", id);
                    return Ok(());
                }
                info!("Resuming job {}", id);
                self.supervisor.submit(*id)?;
                Ok(())
            }
            status => Err(JobError::NotResumable { job_id: *id, status }.into()),
        }
    }

    /// Queues every job left unfinished by a previous process.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut queued = 0;
        for status in [JobStatus::Running, JobStatus::Pending] {
            for job in self.jobs.find_by_status(status) {
                info!("Recovering job {} found {}", job.id(), status);
                self.supervisor.submit(job.id())?;
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Aggregates any raw result table, independent of stored jobs.
    pub fn aggregate_csv(&self, text: &str) -> Result<String> {
        let table = RecordTable::from_csv(text)?;
        Ok(self.aggregator.aggregate(&table)?.to_csv())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.broadcaster.subscribe()
    }

    /// Waits until the job is settled or failed and no run holds it.
    pub async fn wait_for_terminal(&self, id: &JobId) -> Result<Job> {
        let mut events = self.broadcaster.subscribe();
        loop {
            let job = self.jobs.require(id)?;
            if job.status().is_terminal() && !self.orchestrator.is_in_flight(id) {
                return Ok(job);
            }
            // A run that finds the job already settled releases it silently,
            // so the wait also re-checks on a timer.
            match tokio::time::timeout(WAIT_POLL_INTERVAL, events.recv()).await {
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) | Err(_) => continue,
                Ok(Err(RecvError::Closed)) => return Err(WorkerError::ChannelClosed.into()),
            }
        }
    }

    /// Stops accepting work and waits for running jobs to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.supervisor.shutdown().await?;
        Ok(())
    }
}
