//! Upload job types
//!
//! One `UploadJob` record exists per submitted spreadsheet. The record moves
//! `pending -> processing -> completed | failed` and never backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==========================================================================
// Tests First (TDD)
// ==========================================================================


// ==========================================================================
// Status
// ==========================================================================

/// Lifecycle state of an upload job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "processing" => Some(UploadStatus::Processing),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }

    /// Whether a record in `self` may be moved to `next`.
    /// Progress writes keep a processing job in processing.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        match (self, next) {
            (UploadStatus::Pending, UploadStatus::Pending) => false,
            (UploadStatus::Pending, _) => true,
            (UploadStatus::Processing, UploadStatus::Pending) => false,
            (UploadStatus::Processing, _) => true,
            (UploadStatus::Completed | UploadStatus::Failed, _) => false,
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================================================
// Progress / result / errors
// ==========================================================================

/// Row progress of an upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub total_rows: u64,
    pub processed_rows: u64,
    /// `floor(processed_rows / total_rows * 100)`
    pub percentage: u8,
}

impl UploadProgress {
    pub fn new(total_rows: u64, processed_rows: u64) -> Self {
        let processed_rows = processed_rows.min(total_rows);
        let percentage = if total_rows == 0 {
            100
        } else {
            (processed_rows * 100 / total_rows) as u8
        };
        Self {
            total_rows,
            processed_rows,
            percentage,
        }
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.percentage == 100
    }
}

/// Distinct entities persisted or matched by one upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub agents: u64,
    pub users: u64,
    pub accounts: u64,
    pub carriers: u64,
    pub categories: u64,
    pub policies: u64,
}

/// A spreadsheet row that was not imported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    /// Spreadsheet row number (header is row 1)
    pub row: u32,
    pub message: String,
}

impl RowError {
    pub fn new(row: u32, message: impl Into<String>) -> Self {
        Self {
            row,
            message: message.into(),
        }
    }
}

/// Why a job failed as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The file could not be read as a spreadsheet
    UnreadableFile,
    /// A batch transaction failed; earlier batches stay committed
    Persistence,
    /// The worker stopped without reporting an outcome
    WorkerCrash,
}

/// Terminal error recorded on a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Error chain, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ==========================================================================
// Job record
// ==========================================================================

/// Persisted status record of one upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadJob {
    pub job_id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub status: UploadStatus,
    pub progress: UploadProgress,
    pub result: Option<UploadResult>,
    pub errors: Vec<RowError>,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl UploadJob {
    pub fn new(job_id: Uuid, file_name: impl Into<String>, file_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            file_name: file_name.into(),
            file_path: file_path.into(),
            status: UploadStatus::Pending,
            progress: UploadProgress::default(),
            result: None,
            errors: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
        }
    }

    /// Completed, but some rows were rejected
    pub fn is_partial(&self) -> bool {
        self.status == UploadStatus::Completed && !self.errors.is_empty()
    }
}

// ==========================================================================
// Wire types
// ==========================================================================

/// Request to start processing an uploaded file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitUploadRequest {
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitUploadResponse {
    pub job_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusRequest {
    pub job_id: Uuid,
}

/// Polling view of an upload job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub job_id: Uuid,
    pub status: UploadStatus,
    pub processed_rows: u64,
    pub progress: UploadProgress,
    pub result: Option<UploadResult>,
    pub errors: Vec<RowError>,
    pub failure: Option<JobFailure>,
}

impl From<&UploadJob> for UploadStatusResponse {
    fn from(job: &UploadJob) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            processed_rows: job.progress.processed_rows,
            progress: job.progress,
            result: job.result.clone(),
            errors: job.errors.clone(),
            failure: job.failure.clone(),
        }
    }
}
