//! Upload worker
//!
//! Runs one upload end to end on its own store session: read the spreadsheet,
//! cut it into batches, normalize and persist each batch, and report over an
//! ordered message channel. Exactly one terminal message (`Complete` or
//! `Error`) is sent, after the session is closed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::services::normalizer::normalize;
use crate::services::persister::persist_batch;
use crate::services::spreadsheet::read_spreadsheet;
use crate::services::store::{IngestBackend, IngestSession};
use crate::types::{BatchOutcome, JobFailure, RowError, RowRecord, UploadProgress, UploadResult};

/// Worker -> orchestrator protocol: `Progress* (Complete | Error)`
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Progress(UploadProgress),
    Complete {
        result: UploadResult,
        errors: Vec<RowError>,
    },
    Error {
        failure: JobFailure,
        errors: Vec<RowError>,
    },
}

/// Distinct ids per entity kind across the whole upload
#[derive(Debug, Default)]
struct Totals {
    agents: HashSet<Uuid>,
    users: HashSet<Uuid>,
    accounts: HashSet<Uuid>,
    carriers: HashSet<Uuid>,
    categories: HashSet<Uuid>,
    policies: HashSet<Uuid>,
    errors: Vec<RowError>,
}

impl Totals {
    fn absorb(&mut self, outcome: BatchOutcome) {
        self.agents.extend(outcome.agent_ids);
        self.users.extend(outcome.user_ids);
        self.accounts.extend(outcome.account_ids);
        self.carriers.extend(outcome.carrier_ids);
        self.categories.extend(outcome.category_ids);
        self.policies.extend(outcome.policy_ids);
        self.errors.extend(outcome.row_errors);
    }

    fn result(&self) -> UploadResult {
        UploadResult {
            agents: self.agents.len() as u64,
            users: self.users.len() as u64,
            accounts: self.accounts.len() as u64,
            carriers: self.carriers.len() as u64,
            categories: self.categories.len() as u64,
            policies: self.policies.len() as u64,
        }
    }

    fn into_errors(mut self) -> Vec<RowError> {
        self.errors.sort_by_key(|e| e.row);
        self.errors
    }
}

/// Where a job stopped, stored as the failure detail
struct StageError {
    error: IngestError,
    stage: String,
}

impl StageError {
    fn new(error: IngestError, stage: impl Into<String>) -> Self {
        Self {
            error,
            stage: stage.into(),
        }
    }
}

pub struct UploadWorker {
    job_id: Uuid,
    file_path: PathBuf,
    backend: Arc<dyn IngestBackend>,
    batch_size: usize,
}

impl UploadWorker {
    pub fn new(job_id: Uuid, file_path: impl Into<PathBuf>, backend: Arc<dyn IngestBackend>, batch_size: usize) -> Self {
        Self {
            job_id,
            file_path: file_path.into(),
            backend,
            batch_size: batch_size.max(1),
        }
    }

    /// Process the upload, reporting on `tx`
    pub async fn run(self, tx: UnboundedSender<WorkerMessage>) {
        let job_id = self.job_id;
        let mut totals = Totals::default();

        let session = match self.backend.connect().await {
            Ok(session) => session,
            Err(e) => {
                error!("Upload job {} could not open a {} session: {}", job_id, self.backend.name(), e);
                let failure = e.to_failure(Some("connecting to store".to_string()));
                Self::send(&tx, job_id, WorkerMessage::Error { failure, errors: Vec::new() });
                return;
            }
        };
        debug!("Upload job {} connected to {} store", job_id, self.backend.name());

        let outcome = self.process(session.as_ref(), &tx, &mut totals).await;
        session.close().await;

        let message = match outcome {
            Ok(()) => {
                let result = totals.result();
                let errors = totals.into_errors();
                info!(
                    "Upload job {} finished: {} policies, {} users, {} row errors",
                    job_id, result.policies, result.users, errors.len()
                );
                WorkerMessage::Complete { result, errors }
            }
            Err(StageError { error, stage }) => {
                error!("Upload job {} failed while {}: {}", job_id, stage, error);
                WorkerMessage::Error {
                    failure: error.to_failure(Some(stage)),
                    errors: totals.into_errors(),
                }
            }
        };

        Self::send(&tx, job_id, message);
    }

    async fn process(
        &self,
        session: &dyn IngestSession,
        tx: &UnboundedSender<WorkerMessage>,
        totals: &mut Totals,
    ) -> Result<(), StageError> {
        let rows = self
            .read_rows()
            .await
            .map_err(|e| StageError::new(e, "reading spreadsheet"))?;

        let total = rows.len() as u64;
        info!("Upload job {} read {} rows from {}", self.job_id, total, self.file_path.display());

        let mut processed = 0u64;
        for (index, chunk) in rows.chunks(self.batch_size).enumerate() {
            let batch = normalize(chunk);
            totals.errors.extend(batch.rejected.iter().cloned());

            let outcome = persist_batch(session, &batch).await.map_err(|e| {
                let first = chunk.first().map(|r| r.row).unwrap_or_default();
                let last = chunk.last().map(|r| r.row).unwrap_or_default();
                StageError::new(e, format!("persisting batch {} (rows {}-{})", index + 1, first, last))
            })?;
            totals.absorb(outcome);

            processed += chunk.len() as u64;
            debug!(
                "Upload job {} batch {} persisted ({}/{} rows)",
                self.job_id,
                index + 1,
                processed,
                total
            );
            Self::send(tx, self.job_id, WorkerMessage::Progress(UploadProgress::new(total, processed)));
        }

        Ok(())
    }

    async fn read_rows(&self) -> IngestResult<Vec<RowRecord>> {
        let path = self.file_path.clone();
        tokio::task::spawn_blocking(move || read_spreadsheet(&path))
            .await
            .map_err(|e| IngestError::WorkerCrash(format!("spreadsheet reader stopped: {}", e)))?
    }

    fn send(tx: &UnboundedSender<WorkerMessage>, job_id: Uuid, message: WorkerMessage) {
        if tx.send(message).is_err() {
            warn!("Upload job {} supervisor is gone, message dropped", job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryStore;
    use crate::services::test_support::{policy_csv, write_temp_file};
    use crate::types::FailureKind;
    use tokio::sync::mpsc;

    async fn run_worker(path: PathBuf, store: Arc<MemoryStore>, batch_size: usize) -> Vec<WorkerMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        UploadWorker::new(Uuid::new_v4(), path, store, batch_size).run(tx).await;

        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_total() {
        let rows: Vec<(String, String, String)> = (0..7)
            .map(|i| ("A1".to_string(), format!("u{i}@x.com"), format!("P-{i}")))
            .collect();
        let refs: Vec<(&str, &str, &str)> = rows.iter().map(|(a, e, p)| (a.as_str(), e.as_str(), p.as_str())).collect();
        let path = write_temp_file("csv", &policy_csv(&refs));

        let messages = run_worker(path, Arc::new(MemoryStore::new()), 3).await;

        let processed: Vec<u64> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Progress(p) => Some(p.processed_rows),
                _ => None,
            })
            .collect();
        assert_eq!(processed, vec![3, 6, 7]);
        assert!(matches!(messages.last(), Some(WorkerMessage::Complete { .. })));
    }

    #[tokio::test]
    async fn test_missing_file_sends_single_error() {
        let messages = run_worker(PathBuf::from("/nope/missing.xlsx"), Arc::new(MemoryStore::new()), 10).await;

        assert_eq!(messages.len(), 1);
        match &messages[0] {
            WorkerMessage::Error { failure, .. } => {
                assert_eq!(failure.kind, FailureKind::UnreadableFile);
                assert_eq!(failure.detail.as_deref(), Some("reading spreadsheet"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_batch_reports_where_it_stopped() {
        let path = write_temp_file(
            "csv",
            &policy_csv(&[("A1", "a@x.com", "P-1"), ("A1", "b@x.com", "P-2")]),
        );
        let store = Arc::new(MemoryStore::new());

        // Fail from the start: nothing is committed and no progress is reported
        store.fail_account_writes(true);
        let messages = run_worker(path, store.clone(), 1).await;

        assert_eq!(messages.len(), 1);
        match &messages[0] {
            WorkerMessage::Error { failure, .. } => {
                assert_eq!(failure.kind, FailureKind::Persistence);
                assert_eq!(failure.detail.as_deref(), Some("persisting batch 1 (rows 2-2)"));
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(store.snapshot().await.policies.is_empty());
    }

    #[tokio::test]
    async fn test_totals_count_distinct_entities() {
        let path = write_temp_file(
            "csv",
            &policy_csv(&[("A1", "a@x.com", "P-1"), ("A1", "a@x.com", "P-2"), ("A2", "b@x.com", "P-3")]),
        );

        let messages = run_worker(path, Arc::new(MemoryStore::new()), 1).await;
        match messages.last() {
            Some(WorkerMessage::Complete { result, errors }) => {
                assert_eq!(result.agents, 2);
                assert_eq!(result.users, 2);
                assert_eq!(result.accounts, 2);
                assert_eq!(result.carriers, 1);
                assert_eq!(result.categories, 1);
                assert_eq!(result.policies, 3);
                assert!(errors.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
