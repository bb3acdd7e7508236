pub mod aggregate;
pub mod broadcast;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod secrets;
pub mod service;
pub mod worker;

pub use aggregate::{AggregatedTable, Aggregator, RecordTable};
pub use broadcast::{JobPhase, JobProgressBroadcaster, JobProgressEvent};
pub use checkpoint::{CheckpointRecord, CheckpointStore, FieldValue, RecordSchema};
pub use config::{load_config, AggregationConfig, Config, ProviderConfig};
pub use error::{
    AggregateError, CheckpointError, ConfigError, FieldSpecError, FieldmillError, JobError,
    ProviderError, Result, WorkerError,
};
pub use job::{FieldSpec, Job, JobId, JobStatus, JobStore};
pub use logging::{init_logging, LogFormat};
pub use pipeline::{Orchestrator, RetryTicket, RunOutcome};
pub use provider::{Extraction, GeminiProvider, InferenceProvider};
pub use secrets::{resolve_secret, SecretError};
pub use service::{ExtractionService, JobStatusReport, RawRowsPage, ResultView};
