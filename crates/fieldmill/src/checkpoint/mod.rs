//! Durable per-job record of document outcomes.
//!
//! The log is the only source of truth for which documents of a job have
//! been processed; resuming a job recomputes its remaining work from it.

pub mod csv;
pub mod log;
pub mod record;

pub use self::log::{CheckpointLog, CheckpointStore};
pub use record::{CheckpointRecord, FieldValue, RecordSchema};
