//! Job model and the durable job store.

pub mod model;
pub mod store;

pub use model::{Job, JobKind, JobPayload, JobStatus, Priority};
pub use store::{JobQueue, ResetOutcome};
