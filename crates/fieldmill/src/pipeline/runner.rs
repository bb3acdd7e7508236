use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use tracing::{info_span, Instrument};

use crate::broadcast::job_progress::JobPhase;
use crate::checkpoint::record::source_file_name;
use crate::checkpoint::{CheckpointRecord, CheckpointStore, RecordSchema};
use crate::error::{JobError, Result};
use crate::job::{Job, JobId, JobStatus, JobStore};
use crate::provider::{render_instructions, resolve_fields, InferenceProvider};

use super::progress::{ProgressEvent, ProgressReporter};
use super::retry::{self, RetryTicket};

/// What a call to [`Orchestrator::run`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The document loop ran to the end and the job settled in this status.
    Completed(JobStatus),
    /// Nothing to do, the job had already settled.
    AlreadySettled(JobStatus),
    /// Another task in this process is running the job.
    AlreadyRunning,
    /// The job is `Failed` and has to be submitted again.
    RequiresResubmission,
    /// The run aborted and the job is now `Failed` with this message.
    Failed(String),
}

/// Drives jobs through the inference provider, one document at a time,
/// recording each outcome in the job's checkpoint log.
pub struct Orchestrator {
    jobs: Arc<JobStore>,
    checkpoints: CheckpointStore,
    provider: Arc<dyn InferenceProvider>,
    progress: Arc<dyn ProgressReporter>,
    in_flight: Mutex<HashSet<JobId>>,
}

/// Releases a job's in-flight claim when the run ends, however it ends,
/// unless [`Orchestrator::settle`] released it first. Once released, the id
/// may belong to a newer run and must not be touched.
struct InFlightClaim<'a> {
    set: &'a Mutex<HashSet<JobId>>,
    id: JobId,
    armed: AtomicBool,
}

impl InFlightClaim<'_> {
    /// Releases the claim. `set` is the caller's guard on the in-flight set.
    fn release(&self, set: &mut HashSet<JobId>) {
        if self.armed.swap(false, Ordering::AcqRel) {
            set.remove(&self.id);
        }
    }
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        if !*self.armed.get_mut() {
            return;
        }
        let mut set = match self.set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.id);
    }
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<JobStore>,
        checkpoints: CheckpointStore,
        provider: Arc<dyn InferenceProvider>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            jobs,
            checkpoints,
            provider,
            progress,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<JobId>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Orchestrator in-flight lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// True while a task in this process is running the job.
    pub fn is_in_flight(&self, id: &JobId) -> bool {
        self.lock_in_flight().contains(id)
    }

    fn try_claim(&self, id: JobId) -> Option<InFlightClaim<'_>> {
        if !self.lock_in_flight().insert(id) {
            return None;
        }
        Some(InFlightClaim {
            set: &self.in_flight,
            id,
            armed: AtomicBool::new(true),
        })
    }

    /// Applies the run's final status write and releases the claim in one
    /// step, so no observer sees a settled job that is still claimed.
    fn settle<F>(&self, claim: &InFlightClaim<'_>, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> std::result::Result<(), JobError>,
    {
        let mut in_flight = self.lock_in_flight();
        let job = self.jobs.update(&claim.id, mutate)?;
        claim.release(&mut in_flight);
        Ok(job)
    }

    /// Runs a pending job, or resumes a running one from its checkpoint log.
    ///
    /// Settled jobs and jobs already running in this process are left
    /// alone. Errors are returned only when the job could not be read or
    /// its final status could not be stored; everything else ends up in
    /// the job's status.
    pub async fn run(&self, job_id: JobId) -> Result<RunOutcome> {
        let Some(claim) = self.try_claim(job_id) else {
            debug!("Job {} is already running, ignoring run request", job_id);
            return Ok(RunOutcome::AlreadyRunning);
        };

        let job = self.jobs.require(&job_id)?;
        match job.status() {
            JobStatus::Done | JobStatus::DoneWithErrors => {
                debug!("Job {} already settled as {}", job_id, job.status());
                return Ok(RunOutcome::AlreadySettled(job.status()));
            }
            JobStatus::Failed => {
                warn!("Job {} has failed and must be resubmitted", job_id);
                return Ok(RunOutcome::RequiresResubmission);
            }
            JobStatus::Pending | JobStatus::Running => {}
        }

        let span = info_span!("job", job_id = %job_id, documents = job.total_files());
        self.execute(job, &claim).instrument(span).await
    }

    async fn execute(&self, job: Job, claim: &InFlightClaim<'_>) -> Result<RunOutcome> {
        let id = job.id();
        let job = if job.status() == JobStatus::Pending {
            let job = self.jobs.update(&id, Job::start)?;
            info!("Job {} started with {} documents", id, job.total_files());
            self.progress.report(
                &job,
                ProgressEvent::Phase {
                    phase: JobPhase::Started,
                    message: format!("Processing {} documents", job.total_files()),
                },
            );
            job
        } else {
            info!("Resuming job {} from its checkpoint log", id);
            self.progress.report(
                &job,
                ProgressEvent::Phase {
                    phase: JobPhase::Resumed,
                    message: "Resuming from checkpoint log".to_string(),
                },
            );
            job
        };

        let settled = match self.process(&job).await {
            Ok(records) => self.settle(claim, |j| j.complete(records)),
            Err(e) => Err(e),
        };

        match settled {
            Ok(job) => {
                info!(
                    "Job {} finished as {} ({} documents, {} errors)",
                    id,
                    job.status(),
                    job.files_processed(),
                    job.error_count()
                );
                self.progress.report(&job, ProgressEvent::Completed);
                Ok(RunOutcome::Completed(job.status()))
            }
            Err(e) => {
                let message = e.to_string();
                error!("Job {} failed: {}", id, message);
                let job = self.settle(claim, |j| j.fail(&message))?;
                self.progress.report(
                    &job,
                    ProgressEvent::Failed {
                        error: message.clone(),
                    },
                );
                Ok(RunOutcome::Failed(message))
            }
        }
    }

    /// The document loop. Returns the full log once every document has a
    /// record; any error returned here fails the job.
    async fn process(&self, job: &Job) -> Result<Vec<CheckpointRecord>> {
        let id = job.id();
        let mut log = self
            .checkpoints
            .open(id, RecordSchema::from_fields(job.fields()))?;

        if !log.is_empty() {
            info!("Job {}: {} documents already checkpointed", id, log.len());
            self.jobs
                .update(&id, |j| j.update_progress(log.len(), Some(log.error_count())))?;
        }

        let work: Vec<&Path> = job
            .documents()
            .iter()
            .map(PathBuf::as_path)
            .filter(|d| !log.contains(&source_file_name(d)))
            .collect();
        debug!("Job {}: {} documents left to process", id, work.len());

        for document in work {
            let source_file = source_file_name(document);
            match tokio::fs::metadata(document).await {
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(JobError::MissingDocument {
                        path: document.to_path_buf(),
                    }
                    .into());
                }
                _ => {}
            }

            let span = info_span!("document", file = %source_file);
            let record = self
                .extract(job, document, &source_file)
                .instrument(span)
                .await;
            let error = record.is_error().then(|| record.error.clone());

            if log.append(record)? {
                let updated = self.jobs.update(&id, |j| {
                    j.update_progress(log.len(), Some(log.error_count()))
                })?;
                self.progress
                    .report(&updated, ProgressEvent::DocumentRecorded { source_file, error });
            }
        }

        Ok(log.read_all()?)
    }

    /// Runs one document through the provider. Never fails: provider
    /// errors become an error record.
    async fn extract(&self, job: &Job, document: &Path, source_file: &str) -> CheckpointRecord {
        let fields = job.fields();
        let instructions = render_instructions(job.context(), fields, source_file);

        let outcome = match self.provider.process(document, &instructions).await {
            Ok(extractions) => match extractions.first() {
                Some(extraction) => {
                    if extractions.len() > 1 {
                        debug!(
                            "{} returned {} records for {}, keeping the first",
                            self.provider.name(),
                            extractions.len(),
                            source_file
                        );
                    }
                    resolve_fields(extraction, fields).map_err(|e| e.to_string())
                }
                None => Err(format!("No results returned for document {}", source_file)),
            },
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(values) => {
                info!("Extracted {} fields from {}", fields.len(), source_file);
                CheckpointRecord::success(source_file, values)
            }
            Err(message) => {
                warn!("Failed to process {}: {}", source_file, message);
                CheckpointRecord::failure(source_file, fields.len(), &message)
            }
        }
    }

    /// Strips errored records from a `DoneWithErrors` job and puts it back
    /// into `Running`. The caller schedules [`run`](Self::run) when
    /// [`RetryTicket::needs_run`] is set.
    pub fn prepare_retry(&self, job_id: JobId) -> Result<RetryTicket> {
        let in_flight = self.lock_in_flight();
        if in_flight.contains(&job_id) {
            return Err(JobError::InFlight(job_id).into());
        }
        let ticket = retry::prepare_retry(&self.jobs, &self.checkpoints, job_id)?;
        drop(in_flight);

        if let Some(job) = self.jobs.get(&job_id) {
            self.progress.report(
                &job,
                ProgressEvent::Phase {
                    phase: JobPhase::Retrying,
                    message: format!("Retrying {} failed documents", ticket.removed.len()),
                },
            );
            if !ticket.needs_run() {
                self.progress.report(&job, ProgressEvent::Completed);
            }
        }
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::checkpoint::FieldValue;
    use crate::error::{FieldmillError, ProviderError};
    use crate::job::FieldSpec;
    use crate::pipeline::progress::NoopProgress;
    use crate::provider::Extraction;

    /// Answers by file name; unknown files get a yes/no pair.
    #[derive(Default)]
    struct FakeProvider {
        failures: Mutex<HashMap<String, String>>,
        empty: HashSet<String>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn failing(names: &[&str]) -> Self {
            let failures = names
                .iter()
                .map(|n| (n.to_string(), format!("upstream error for {}", n)))
                .collect();
            Self {
                failures: Mutex::new(failures),
                ..Default::default()
            }
        }

        fn heal(&self) {
            self.failures.lock().unwrap().clear();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InferenceProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn process(
            &self,
            document: &Path,
            _instructions: &str,
        ) -> std::result::Result<Vec<Extraction>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = source_file_name(document);
            if let Some(message) = self.failures.lock().unwrap().get(&name) {
                return Err(ProviderError::Malformed(message.clone()));
            }
            if self.empty.contains(&name) {
                return Ok(vec![]);
            }
            let mut extraction = Extraction::new();
            extraction.insert("country".to_string(), FieldValue::new("Austria", ""));
            extraction.insert(
                "has_policy".to_string(),
                FieldValue::new("yes", &format!("see {}", name)),
            );
            Ok(vec![extraction])
        }
    }

    struct Fixture {
        _dir: TempDir,
        docs: PathBuf,
        data: PathBuf,
        jobs: Arc<JobStore>,
    }

    fn fixture(names: &[&str]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        for name in names {
            std::fs::write(docs.join(name), b"%PDF-1.4").unwrap();
        }
        Fixture {
            docs,
            data: dir.path().join("data"),
            _dir: dir,
            jobs: Arc::new(JobStore::new()),
        }
    }

    impl Fixture {
        fn orchestrator(&self, provider: Arc<FakeProvider>) -> Orchestrator {
            Orchestrator::new(
                self.jobs.clone(),
                CheckpointStore::new(&self.data),
                provider,
                Arc::new(NoopProgress),
            )
        }

        fn submit(&self, names: &[&str]) -> JobId {
            let job = Job::new(
                names.iter().map(|n| self.docs.join(n)).collect(),
                "policy documents",
                vec![
                    FieldSpec::new("country", "").unwrap(),
                    FieldSpec::new("has_policy", "").unwrap(),
                ],
            )
            .unwrap();
            let id = job.id();
            self.jobs.insert(job).unwrap();
            id
        }
    }

    #[tokio::test]
    async fn test_run_all_documents_succeed() {
        let fx = fixture(&["a.pdf", "b.pdf"]);
        let id = fx.submit(&["a.pdf", "b.pdf"]);
        let orchestrator = fx.orchestrator(Arc::new(FakeProvider::default()));

        let outcome = orchestrator.run(id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(JobStatus::Done));

        let job = fx.jobs.get(&id).unwrap();
        assert_eq!(job.files_processed(), 2);
        assert_eq!(job.error_count(), 0);
        let result = job.result().unwrap();
        assert_eq!(result[0].source_file, "a.pdf");
        assert_eq!(result[1].values[1], FieldValue::new("yes", "see b.pdf"));
        assert!(!orchestrator.is_in_flight(&id));
    }

    #[tokio::test]
    async fn test_document_errors_are_recorded_not_fatal() {
        let fx = fixture(&["a.pdf", "b.pdf", "c.pdf"]);
        let id = fx.submit(&["a.pdf", "b.pdf", "c.pdf"]);
        let orchestrator = fx.orchestrator(Arc::new(FakeProvider::failing(&["b.pdf"])));

        let outcome = orchestrator.run(id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(JobStatus::DoneWithErrors));

        let job = fx.jobs.get(&id).unwrap();
        assert_eq!(job.files_processed(), 3);
        assert_eq!(job.error_count(), 1);
        let failed = &job.result().unwrap()[1];
        assert!(failed.error.contains("upstream error for b.pdf"));
        assert!(failed.values.iter().all(|v| v.value.is_empty()));
    }

    #[tokio::test]
    async fn test_empty_provider_result_is_a_document_error() {
        let fx = fixture(&["a.pdf"]);
        let id = fx.submit(&["a.pdf"]);
        let provider = FakeProvider {
            empty: ["a.pdf".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let orchestrator = fx.orchestrator(Arc::new(provider));

        orchestrator.run(id).await.unwrap();
        let job = fx.jobs.get(&id).unwrap();
        assert_eq!(job.status(), JobStatus::DoneWithErrors);
        assert_eq!(
            job.result().unwrap()[0].error,
            "No results returned for document a.pdf"
        );
    }

    #[tokio::test]
    async fn test_missing_document_fails_the_job() {
        let fx = fixture(&["a.pdf"]);
        let id = fx.submit(&["a.pdf", "gone.pdf"]);
        let orchestrator = fx.orchestrator(Arc::new(FakeProvider::default()));

        let outcome = orchestrator.run(id).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed(ref m) if m.contains("gone.pdf")));

        let job = fx.jobs.get(&id).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.result().is_none());
        assert_eq!(job.files_processed(), 1);

        // Failed jobs are not picked up again.
        let again = orchestrator.run(id).await.unwrap();
        assert_eq!(again, RunOutcome::RequiresResubmission);
    }

    #[tokio::test]
    async fn test_settled_job_is_a_no_op() {
        let fx = fixture(&["a.pdf"]);
        let id = fx.submit(&["a.pdf"]);
        let provider = Arc::new(FakeProvider::default());
        let orchestrator = fx.orchestrator(provider.clone());

        orchestrator.run(id).await.unwrap();
        let outcome = orchestrator.run(id).await.unwrap();
        assert_eq!(outcome, RunOutcome::AlreadySettled(JobStatus::Done));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_claimed_job_is_not_run_twice() {
        let fx = fixture(&["a.pdf"]);
        let id = fx.submit(&["a.pdf"]);
        let provider = Arc::new(FakeProvider::default());
        let orchestrator = fx.orchestrator(provider.clone());

        let claim = orchestrator.try_claim(id).unwrap();
        assert_eq!(orchestrator.run(id).await.unwrap(), RunOutcome::AlreadyRunning);
        assert_eq!(provider.calls(), 0);
        drop(claim);

        assert_eq!(
            orchestrator.run(id).await.unwrap(),
            RunOutcome::Completed(JobStatus::Done)
        );
    }

    /// Claims the job again as soon as a run reports completion, the way a
    /// follow-up run started by a waiting caller would.
    struct ReclaimOnCompleted {
        orchestrator: Weak<Orchestrator>,
    }

    impl ProgressReporter for ReclaimOnCompleted {
        fn report(&self, job: &Job, event: ProgressEvent) {
            if let (ProgressEvent::Completed, Some(orchestrator)) =
                (event, self.orchestrator.upgrade())
            {
                assert!(orchestrator.lock_in_flight().insert(job.id()));
            }
        }
    }

    #[tokio::test]
    async fn test_finished_run_keeps_hands_off_a_newer_claim() {
        let fx = fixture(&["a.pdf"]);
        let id = fx.submit(&["a.pdf"]);
        let orchestrator = Arc::new_cyclic(|weak: &Weak<Orchestrator>| {
            Orchestrator::new(
                fx.jobs.clone(),
                CheckpointStore::new(&fx.data),
                Arc::new(FakeProvider::default()),
                Arc::new(ReclaimOnCompleted {
                    orchestrator: weak.clone(),
                }),
            )
        });

        let outcome = orchestrator.run(id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(JobStatus::Done));
        assert!(orchestrator.is_in_flight(&id));
        assert_eq!(orchestrator.run(id).await.unwrap(), RunOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_documents() {
        let fx = fixture(&["a.pdf", "b.pdf", "c.pdf"]);
        let id = fx.submit(&["a.pdf", "b.pdf", "c.pdf"]);
        let job = fx.jobs.get(&id).unwrap();

        // Simulate a run that died after the first document.
        let store = CheckpointStore::new(&fx.data);
        let mut log = store
            .open(id, RecordSchema::from_fields(job.fields()))
            .unwrap();
        log.append(CheckpointRecord::success(
            "a.pdf",
            vec![FieldValue::new("Austria", ""), FieldValue::new("no", "p. 1")],
        ))
        .unwrap();
        let before = std::fs::read_to_string(log.path()).unwrap();
        drop(log);
        fx.jobs.update(&id, Job::start).unwrap();

        let provider = Arc::new(FakeProvider::default());
        let orchestrator = fx.orchestrator(provider.clone());
        let outcome = orchestrator.run(id).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed(JobStatus::Done));
        assert_eq!(provider.calls(), 2);
        let after = std::fs::read_to_string(store.log_path(&id)).unwrap();
        assert!(after.starts_with(&before));

        let result = fx.jobs.get(&id).unwrap().result().unwrap().to_vec();
        let names: Vec<&str> = result.iter().map(|r| r.source_file.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "b.pdf", "c.pdf"]);
        assert_eq!(result[0].values[1].value, "no");
    }

    #[tokio::test]
    async fn test_retry_reprocesses_only_failed_documents() {
        let fx = fixture(&["a.pdf", "b.pdf", "c.pdf"]);
        let id = fx.submit(&["a.pdf", "b.pdf", "c.pdf"]);
        let provider = Arc::new(FakeProvider::failing(&["b.pdf", "c.pdf"]));
        let orchestrator = fx.orchestrator(provider.clone());

        orchestrator.run(id).await.unwrap();
        assert_eq!(fx.jobs.get(&id).unwrap().error_count(), 2);

        let ticket = orchestrator.prepare_retry(id).unwrap();
        assert!(ticket.needs_run());
        assert_eq!(ticket.errors_before, 2);
        assert_eq!(ticket.processed_before, 3);
        assert_eq!(ticket.pending, 2);
        assert_eq!(ticket.cleaned_csv.lines().count(), 2);

        let job = fx.jobs.get(&id).unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.files_processed(), 1);
        assert_eq!(job.error_count(), 0);

        provider.heal();
        let outcome = orchestrator.run(id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(JobStatus::Done));
        assert_eq!(provider.calls(), 5);

        let result = fx.jobs.get(&id).unwrap().result().unwrap().to_vec();
        assert!(result.iter().all(|r| !r.is_error()));
    }

    #[tokio::test]
    async fn test_retry_rejected_unless_done_with_errors() {
        let fx = fixture(&["a.pdf"]);
        let id = fx.submit(&["a.pdf"]);
        let orchestrator = fx.orchestrator(Arc::new(FakeProvider::default()));

        let err = orchestrator.prepare_retry(id).unwrap_err();
        assert!(matches!(
            err,
            FieldmillError::Job(JobError::NotRetryable {
                status: JobStatus::Pending,
                ..
            })
        ));

        orchestrator.run(id).await.unwrap();
        assert!(orchestrator.prepare_retry(id).is_err());
    }
}
