pub mod progress;
pub mod retry;
pub mod runner;

pub use progress::{BroadcastProgress, NoopProgress, ProgressEvent, ProgressReporter};
pub use retry::{prepare_retry, RetryTicket};
pub use runner::{Orchestrator, RunOutcome};
