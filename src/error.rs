//! Ingestion error taxonomy

use thiserror::Error;
use uuid::Uuid;

use crate::types::{FailureKind, JobFailure, UploadStatus};

#[derive(Debug, Error)]
pub enum IngestError {
    /// Missing, corrupt or unsupported input file. Fatal for the job, never retried.
    #[error("unreadable file '{path}': {reason}")]
    UnreadableFile { path: String, reason: String },

    /// A batch transaction failed. Earlier batches stay committed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("upload job {0} not found")]
    NotFound(Uuid),

    /// The worker stopped without a terminal message
    #[error("worker stopped unexpectedly: {0}")]
    WorkerCrash(String),

    #[error("upload job cannot move from {from} to {to}")]
    InvalidTransition { from: UploadStatus, to: UploadStatus },

    /// Settled outcome of a job that ended in `failed`
    #[error("upload job {job_id} failed: {}", .failure.message)]
    JobFailed { job_id: Uuid, failure: JobFailure },
}

impl IngestError {
    pub fn unreadable(path: impl Into<String>, reason: impl ToString) -> Self {
        IngestError::UnreadableFile {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            IngestError::UnreadableFile { .. } => FailureKind::UnreadableFile,
            IngestError::WorkerCrash(_) => FailureKind::WorkerCrash,
            IngestError::JobFailed { failure, .. } => failure.kind,
            IngestError::Persistence(_)
            | IngestError::NotFound(_)
            | IngestError::InvalidTransition { .. } => FailureKind::Persistence,
        }
    }

    /// Terminal record stored on the failed job; `detail` locates where it happened
    pub fn to_failure(&self, detail: Option<String>) -> JobFailure {
        JobFailure {
            kind: self.failure_kind(),
            message: self.to_string(),
            detail,
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(e: sqlx::Error) -> Self {
        IngestError::Persistence(e.to_string())
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
