//! Asynchronous, restart-durable job management for external prediction runs.
//!
//! A [`JobManager`] persists every submitted command as a [`JobRecord`] in a
//! [`JobStore`], runs it on its own tokio task through the process runner,
//! and answers status, result, log and list queries straight from disk.

pub mod error;
pub mod id;
pub mod log;
pub mod manager;
pub mod record;
pub mod runner;
pub mod store;

pub use error::{JobError, JobErrorKind, JobsResult};
pub use id::generate_job_id;
pub use log::{read_log_tail, JobLog};
pub use manager::{JobManager, JobManagerConfig, RecoveryReport, SubmitRequest};
pub use record::{JobCommand, JobOutcome, JobRecord, JobResult, JobStatus, JobStatusFilter};
pub use runner::{decode_job_result, run_process, ProcessSpec, RunOutcome};
pub use store::JobStore;
