//! Upload orchestrator
//!
//! Creates the job record, spawns one worker task per upload and turns the
//! worker's messages into job record updates. The supervisor settles each job
//! exactly once: on the first terminal message, or with a synthesized
//! `WorkerCrash` when the worker stops without one.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::services::store::IngestBackend;
use crate::services::upload_jobs::UploadJobs;
use crate::services::worker::{UploadWorker, WorkerMessage};
use crate::types::{RowError, UploadJob, UploadStatus};

/// Settled outcome of one upload. Dropping the handle does not affect the job.
pub struct UploadHandle {
    pub job_id: Uuid,
    settled: oneshot::Receiver<IngestResult<UploadJob>>,
}

impl UploadHandle {
    /// Wait for the job to settle. A failed job yields `IngestError::JobFailed`.
    pub async fn wait(self) -> IngestResult<UploadJob> {
        self.settled
            .await
            .map_err(|_| IngestError::WorkerCrash(format!("supervisor for upload job {} stopped", self.job_id)))?
    }
}

pub struct UploadOrchestrator {
    jobs: Arc<UploadJobs>,
    backend: Arc<dyn IngestBackend>,
    batch_size: usize,
}

impl UploadOrchestrator {
    pub fn new(jobs: Arc<UploadJobs>, backend: Arc<dyn IngestBackend>, batch_size: usize) -> Self {
        Self {
            jobs,
            backend,
            batch_size,
        }
    }

    /// Create the job record and start processing in the background
    pub async fn submit(
        &self,
        job_id: Option<Uuid>,
        file_path: impl Into<PathBuf>,
        file_name: &str,
    ) -> IngestResult<UploadHandle> {
        let job_id = job_id.unwrap_or_else(Uuid::new_v4);
        let file_path = file_path.into();

        self.jobs
            .create(job_id, file_name, &file_path.display().to_string())
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = UploadWorker::new(job_id, file_path, self.backend.clone(), self.batch_size);
        let worker = tokio::spawn(worker.run(tx));

        let (settle_tx, settle_rx) = oneshot::channel();
        tokio::spawn(supervise(self.jobs.clone(), job_id, rx, worker, settle_tx));

        info!("Upload job {} submitted", job_id);
        Ok(UploadHandle {
            job_id,
            settled: settle_rx,
        })
    }

    /// Current record of a job
    pub async fn status(&self, job_id: Uuid) -> IngestResult<UploadJob> {
        self.jobs.get(job_id).await
    }
}

/// Apply worker messages to the job record until the job settles
async fn supervise(
    jobs: Arc<UploadJobs>,
    job_id: Uuid,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    worker: JoinHandle<()>,
    settle: oneshot::Sender<IngestResult<UploadJob>>,
) {
    let mut worker = Some(worker);

    let outcome = loop {
        match rx.recv().await {
            Some(WorkerMessage::Progress(progress)) => {
                if let Err(e) = jobs.update_progress(job_id, progress).await {
                    warn!("Upload job {} progress update failed: {}", job_id, e);
                }
            }
            Some(WorkerMessage::Complete { result, errors }) => {
                break match jobs.complete(job_id, &result, &errors).await {
                    Ok(()) => Ok(()),
                    Err(e) => record_failed_completion(&jobs, job_id, e, &errors).await,
                };
            }
            Some(WorkerMessage::Error { failure, errors }) => {
                break jobs.fail(job_id, &failure, &errors).await;
            }
            None => {
                let reason = match worker.take() {
                    Some(handle) => match handle.await {
                        Err(e) if e.is_panic() => panic_message(e.into_panic()),
                        Err(e) => e.to_string(),
                        Ok(()) => "worker exited without reporting an outcome".to_string(),
                    },
                    None => "worker exited without reporting an outcome".to_string(),
                };
                error!("Upload job {} worker crashed: {}", job_id, reason);

                let failure = IngestError::WorkerCrash(reason).to_failure(None);
                break jobs.fail(job_id, &failure, &[]).await;
            }
        }
    };

    // Terminal message handled, tear the worker down
    if let Some(handle) = worker {
        handle.abort();
        if let Err(e) = handle.await {
            if e.is_panic() {
                warn!("Upload job {} worker panicked after settling", job_id);
            }
        }
    }

    let settled = match outcome {
        Ok(()) => settled_job(&jobs, job_id).await,
        Err(e) => {
            error!("Upload job {} could not be settled: {}", job_id, e);
            Err(e)
        }
    };

    if settle.send(settled).is_err() {
        debug!("Upload job {} settled with no waiter", job_id);
    }
}

/// Fail the job when its completion cannot be written
async fn record_failed_completion(
    jobs: &UploadJobs,
    job_id: Uuid,
    cause: IngestError,
    errors: &[RowError],
) -> IngestResult<()> {
    error!("Upload job {} completion could not be recorded: {}", job_id, cause);

    let failure = cause.to_failure(Some("recording completion".to_string()));
    if let Err(e) = jobs.fail(job_id, &failure, errors).await {
        error!("Upload job {} failure could not be recorded either: {}", job_id, e);
        return Err(cause);
    }
    Ok(())
}

async fn settled_job(jobs: &UploadJobs, job_id: Uuid) -> IngestResult<UploadJob> {
    let job = jobs.get(job_id).await?;

    if let (UploadStatus::Failed, Some(failure)) = (job.status, job.failure.as_ref()) {
        info!("Upload job {} failed: {}", job_id, failure.message);
        return Err(IngestError::JobFailed {
            job_id,
            failure: failure.clone(),
        });
    }

    if job.is_partial() {
        warn!(
            "Upload job {} completed as a partial import ({} rows rejected)",
            job_id,
            job.errors.len()
        );
    } else {
        info!("Upload job {} completed", job_id);
    }
    Ok(job)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {}", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::services::store::{IngestSession, MemoryStore, UploadStore};
    use crate::services::test_support::{policy_csv, write_temp_file};
    use crate::types::{FailureKind, JobFailure, UploadProgress, UploadResult};

    fn orchestrator(store: &Arc<MemoryStore>, batch_size: usize) -> UploadOrchestrator {
        let jobs = Arc::new(UploadJobs::new(store.clone()));
        UploadOrchestrator::new(jobs, store.clone(), batch_size)
    }

    /// Backend whose worker dies while connecting
    struct PanickingBackend;

    #[async_trait]
    impl IngestBackend for PanickingBackend {
        async fn connect(&self) -> IngestResult<Box<dyn IngestSession>> {
            panic!("connection pool exploded");
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    /// Upload store that cannot record completions
    struct CompletionFailsStore(Arc<MemoryStore>);

    #[async_trait]
    impl UploadStore for CompletionFailsStore {
        async fn create(&self, job: &UploadJob) -> IngestResult<()> {
            self.0.create(job).await
        }

        async fn write_progress(&self, job_id: Uuid, progress: UploadProgress) -> IngestResult<()> {
            self.0.write_progress(job_id, progress).await
        }

        async fn complete(&self, _job_id: Uuid, _result: &UploadResult, _errors: &[RowError]) -> IngestResult<()> {
            Err(IngestError::Persistence("connection reset".into()))
        }

        async fn fail(&self, job_id: Uuid, failure: &JobFailure, errors: &[RowError]) -> IngestResult<()> {
            self.0.fail(job_id, failure, errors).await
        }

        async fn get(&self, job_id: Uuid) -> IngestResult<UploadJob> {
            self.0.get(job_id).await
        }

        fn name(&self) -> &'static str {
            "completion-fails"
        }
    }

    #[tokio::test]
    async fn test_three_row_upload_completes() {
        let store = Arc::new(MemoryStore::new());
        let path = write_temp_file(
            "csv",
            &policy_csv(&[("A1", "u1@x.com", "P-1"), ("A1", "u2@x.com", "P-2"), ("A1", "u3@x.com", "P-3")]),
        );

        let handle = orchestrator(&store, 1000)
            .submit(None, &path, "three.csv")
            .await
            .unwrap();
        let job = handle.wait().await.unwrap();

        assert_eq!(job.status, UploadStatus::Completed);
        assert_eq!(job.progress.processed_rows, 3);
        assert_eq!(job.progress.percentage, 100);
        let result = job.result.unwrap();
        assert_eq!(result.agents, 1);
        assert_eq!(result.users, 3);
        assert_eq!(result.policies, 3);
        assert!(job.errors.is_empty());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_blank_email_row_is_reported_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let path = write_temp_file(
            "csv",
            &policy_csv(&[("A1", "u1@x.com", "P-1"), ("A1", "", "P-2"), ("A1", "u3@x.com", "P-3")]),
        );

        let job = orchestrator(&store, 1000)
            .submit(None, &path, "blank.csv")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(job.status, UploadStatus::Completed);
        assert!(job.is_partial());
        assert_eq!(job.errors, vec![RowError::new(3, "missing required field(s): email")]);
        assert_eq!(job.result.unwrap().policies, 2);
        assert_eq!(store.snapshot().await.users.len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_file_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(&store, 1000);
        let job_id = Uuid::new_v4();

        let err = orchestrator
            .submit(Some(job_id), "/nope/missing.xlsx", "missing.xlsx")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::UnreadableFile);

        let job = orchestrator.status(job_id).await.unwrap();
        assert_eq!(job.status, UploadStatus::Failed);
        assert_eq!(job.failure.unwrap().kind, FailureKind::UnreadableFile);
        assert!(job.failed_at.is_some());
    }

    #[tokio::test]
    async fn test_worker_panic_is_synthesized_into_crash() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(UploadJobs::new(store.clone()));
        let orchestrator = UploadOrchestrator::new(jobs, Arc::new(PanickingBackend), 1000);
        let path = write_temp_file("csv", &policy_csv(&[("A1", "u1@x.com", "P-1")]));

        let handle = orchestrator.submit(None, &path, "crash.csv").await.unwrap();
        let job_id = handle.job_id;
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::WorkerCrash);

        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status, UploadStatus::Failed);
        let failure = job.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::WorkerCrash);
        assert!(failure.message.contains("connection pool exploded"));
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_earlier_batches() {
        let store = Arc::new(MemoryStore::new());
        let first = write_temp_file("csv", &policy_csv(&[("A1", "u1@x.com", "P-1")]));
        orchestrator(&store, 1)
            .submit(None, &first, "first.csv")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        store.fail_account_writes(true);
        let second = write_temp_file("csv", &policy_csv(&[("A2", "u2@x.com", "P-2")]));
        let err = orchestrator(&store, 1)
            .submit(None, &second, "second.csv")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();

        assert_eq!(err.failure_kind(), FailureKind::Persistence);
        let tables = store.snapshot().await;
        assert_eq!(tables.policies.len(), 1);
        assert_eq!(tables.users.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_reaches_total_with_small_batches() {
        let store = Arc::new(MemoryStore::new());
        let path = write_temp_file(
            "csv",
            &policy_csv(&[
                ("A1", "u1@x.com", "P-1"),
                ("A1", "u2@x.com", "P-2"),
                ("A1", "u3@x.com", "P-3"),
                ("A1", "u4@x.com", "P-4"),
                ("A1", "u5@x.com", "P-5"),
            ]),
        );

        let job = orchestrator(&store, 2)
            .submit(None, &path, "five.csv")
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(job.progress.total_rows, 5);
        assert_eq!(job.progress.processed_rows, 5);
        assert_eq!(job.result.unwrap().policies, 5);
    }

    #[tokio::test]
    async fn test_duplicate_job_id_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(&store, 1000);
        let path = write_temp_file("csv", &policy_csv(&[("A1", "u1@x.com", "P-1")]));
        let job_id = Uuid::new_v4();

        orchestrator.submit(Some(job_id), &path, "a.csv").await.unwrap();
        assert!(orchestrator.submit(Some(job_id), &path, "a.csv").await.is_err());
    }

    #[tokio::test]
    async fn test_unrecorded_completion_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(UploadJobs::new(Arc::new(CompletionFailsStore(store.clone()))));
        let orchestrator = UploadOrchestrator::new(jobs, store.clone(), 1000);
        let path = write_temp_file("csv", &policy_csv(&[("A1", "u1@x.com", "P-1")]));

        let handle = orchestrator.submit(None, &path, "reset.csv").await.unwrap();
        let job_id = handle.job_id;
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Persistence);

        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status, UploadStatus::Failed);
        let failure = job.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Persistence);
        assert!(failure.message.contains("connection reset"));
        assert_eq!(failure.detail.as_deref(), Some("recording completion"));
        assert_eq!(store.snapshot().await.policies.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_exit_without_outcome_is_crash() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(UploadJobs::new(store.clone()));
        let job_id = Uuid::new_v4();
        jobs.create(job_id, "quiet.csv", "/tmp/quiet.csv").await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let worker = tokio::spawn(async move {
            drop(tx);
        });
        let (settle_tx, settle_rx) = oneshot::channel();
        supervise(jobs, job_id, rx, worker, settle_tx).await;

        let err = settle_rx.await.unwrap().unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::WorkerCrash);

        let failure = store.get(job_id).await.unwrap().failure.unwrap();
        assert_eq!(failure.kind, FailureKind::WorkerCrash);
        assert!(failure.message.contains("without reporting an outcome"));
    }

    #[test]
    fn test_panic_message_reads_str_and_string() {
        assert_eq!(panic_message(Box::new("boom")), "worker panicked: boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "worker panicked: bang");
        assert_eq!(panic_message(Box::new(7u8)), "worker panicked: unknown panic");
    }
}
