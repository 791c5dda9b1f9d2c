use std::path::PathBuf;

use thiserror::Error;

use crate::record::JobStatus;

/// Result type for job store and job manager operations.
pub type JobsResult<T> = Result<T, JobError>;

/// Coarse error classes surfaced to callers of the job manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    ExecutionFailure,
    PersistenceFailure,
}

impl JobErrorKind {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InvalidState => "invalid_state",
            Self::ExecutionFailure => "execution_failure",
            Self::PersistenceFailure => "persistence_failure",
        }
    }
}

/// Errors returned by the job store and job manager.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job '{job_id}' not found")]
    NotFound { job_id: String },
    #[error("job '{job_id}' has no execution log at {}", path.display())]
    LogNotFound { job_id: String, path: PathBuf },
    #[error("job '{job_id}' already exists")]
    Conflict { job_id: String },
    #[error("job '{job_id}' is {status}; cannot {operation}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },
    #[error("job '{job_id}' is {status}; result is not available")]
    NotReady { job_id: String, status: JobStatus },
    #[error("invalid job request: {reason}")]
    InvalidRequest { reason: String },
    #[error("job '{job_id}' failed: {message}")]
    ExecutionFailure { job_id: String, message: String },
    #[error("job '{job_id}' could not be persisted at {}: {source}", path.display())]
    Persistence {
        job_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("job '{job_id}' record at {} is corrupt: {reason}", path.display())]
    CorruptRecord {
        job_id: String,
        path: PathBuf,
        reason: String,
    },
    #[error("job store at {} is unavailable: {source}", path.display())]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    /// Classifies the error into the caller-facing taxonomy.
    pub fn kind(&self) -> JobErrorKind {
        match self {
            Self::NotFound { .. } | Self::LogNotFound { .. } => JobErrorKind::NotFound,
            Self::Conflict { .. } => JobErrorKind::Conflict,
            Self::InvalidState { .. } | Self::NotReady { .. } | Self::InvalidRequest { .. } => {
                JobErrorKind::InvalidState
            }
            Self::ExecutionFailure { .. } => JobErrorKind::ExecutionFailure,
            Self::Persistence { .. } | Self::CorruptRecord { .. } | Self::StoreUnavailable { .. } => {
                JobErrorKind::PersistenceFailure
            }
        }
    }

    /// Returns the job the error refers to, when there is one.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::NotFound { job_id }
            | Self::LogNotFound { job_id, .. }
            | Self::Conflict { job_id }
            | Self::InvalidState { job_id, .. }
            | Self::NotReady { job_id, .. }
            | Self::ExecutionFailure { job_id, .. }
            | Self::Persistence { job_id, .. }
            | Self::CorruptRecord { job_id, .. } => Some(job_id.as_str()),
            Self::InvalidRequest { .. } | Self::StoreUnavailable { .. } => None,
        }
    }

    pub(crate) fn persistence(
        job_id: &str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Persistence {
            job_id: job_id.to_string(),
            path: path.into(),
            source,
        }
    }
}
