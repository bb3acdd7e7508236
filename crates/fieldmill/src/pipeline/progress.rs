use crate::broadcast::job_progress::{JobPhase, JobProgressBroadcaster, JobProgressEvent};
use crate::job::Job;

/// Events emitted by the orchestrator while running a job.
pub enum ProgressEvent {
    Phase {
        phase: JobPhase,
        message: String,
    },
    DocumentRecorded {
        source_file: String,
        error: Option<String>,
    },
    Completed,
    Failed {
        error: String,
    },
}

pub trait ProgressReporter: Send + Sync {
    /// `job` is the state right after the event took effect.
    fn report(&self, job: &Job, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _job: &Job, _event: ProgressEvent) {}
}

/// Bridges orchestrator events to the broadcast channel.
pub struct BroadcastProgress {
    broadcaster: JobProgressBroadcaster,
}

impl BroadcastProgress {
    pub fn new(broadcaster: JobProgressBroadcaster) -> Self {
        Self { broadcaster }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, job: &Job, event: ProgressEvent) {
        let event = match event {
            ProgressEvent::Phase { phase, message } => {
                JobProgressEvent::from_job(job, phase, &message)
            }
            ProgressEvent::DocumentRecorded { source_file, error } => {
                let message = format!(
                    "Recorded {} ({}/{})",
                    source_file,
                    job.files_processed(),
                    job.total_files()
                );
                let event = JobProgressEvent::from_job(job, JobPhase::DocumentRecorded, &message)
                    .with_source_file(&source_file);
                match error {
                    Some(error) => event.with_error(&error),
                    None => event,
                }
            }
            ProgressEvent::Completed => {
                let message = format!(
                    "Finished with {} of {} documents failing",
                    job.error_count(),
                    job.total_files()
                );
                JobProgressEvent::from_job(job, JobPhase::Completed, &message)
            }
            ProgressEvent::Failed { error } => {
                JobProgressEvent::from_job(job, JobPhase::Failed, "Job failed").with_error(&error)
            }
        };
        self.broadcaster.send(event);
    }
}
