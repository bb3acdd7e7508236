//! Jobs, their field specifications, and the store that tracks them.

pub mod field;
pub mod model;
pub mod store;

pub use field::{build_field_specs, parse_fields_payload, FieldSpec, FieldSpecInput};
pub use model::{Job, JobId, JobStatus};
pub use store::{JobStore, StatusCounts};
