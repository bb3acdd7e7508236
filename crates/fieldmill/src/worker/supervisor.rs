use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::WorkerError;
use crate::job::JobId;
use crate::pipeline::{Orchestrator, RunOutcome};

/// Owns the background tasks that run jobs.
///
/// Job ids are handed over through a queue; at most `max_concurrent`
/// jobs run at once, each on its own task. Every task's outcome is
/// logged here, so no run is left detached.
pub struct JobSupervisor {
    sender: mpsc::UnboundedSender<JobId>,
    handle: JoinHandle<()>,
}

impl JobSupervisor {
    /// Starts the supervisor loop. Must be called inside a Tokio runtime.
    pub fn spawn(orchestrator: Arc<Orchestrator>, max_concurrent: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let max_concurrent = max_concurrent.max(1);
        let handle = tokio::spawn(supervise(orchestrator, receiver, max_concurrent));
        info!("Job supervisor started (max {} concurrent jobs)", max_concurrent);
        Self { sender, handle }
    }

    pub fn submit(&self, job_id: JobId) -> Result<(), WorkerError> {
        self.sender
            .send(job_id)
            .map_err(|_| WorkerError::ChannelClosed)
    }

    /// Stops accepting work and waits for every queued and running job.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        info!("Shutting down job supervisor...");
        drop(self.sender);
        self.handle
            .await
            .map_err(|e| WorkerError::TaskFailed(e.to_string()))?;
        info!("All job tasks have stopped");
        Ok(())
    }
}

async fn supervise(
    orchestrator: Arc<Orchestrator>,
    mut receiver: mpsc::UnboundedReceiver<JobId>,
    max_concurrent: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut tasks = JoinSet::new();

    loop {
        while let Some(result) = tasks.try_join_next() {
            log_task_result(result);
        }

        let Some(job_id) = receiver.recv().await else {
            debug!("Supervisor queue closed");
            break;
        };

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("Supervisor semaphore closed, dropping job {}", job_id);
                break;
            }
        };

        let orchestrator = Arc::clone(&orchestrator);
        tasks.spawn(async move {
            let _permit = permit;
            (job_id, orchestrator.run(job_id).await)
        });
    }

    while let Some(result) = tasks.join_next().await {
        log_task_result(result);
    }
}

type TaskResult = Result<(JobId, crate::error::Result<RunOutcome>), tokio::task::JoinError>;

fn log_task_result(result: TaskResult) {
    match result {
        Ok((job_id, Ok(RunOutcome::Completed(status)))) => {
            info!("Job {} task finished: {}", job_id, status)
        }
        Ok((job_id, Ok(RunOutcome::Failed(message)))) => {
            warn!("Job {} task ended in failure: {}", job_id, message)
        }
        Ok((job_id, Ok(outcome))) => debug!("Job {} task skipped: {:?}", job_id, outcome),
        Ok((job_id, Err(e))) => error!("Job {} task could not record its outcome: {}", job_id, e),
        Err(e) => error!("Job task panicked: {}", e),
    }
}
