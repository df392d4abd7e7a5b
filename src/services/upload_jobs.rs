//! Upload job records with throttled progress writes
//!
//! Progress is persisted only when the percentage advanced by at least
//! `PROGRESS_PERSIST_STEP` points since the last persisted write, or reached 100.
//! The last persisted percentage per in-flight job lives in a bounded map that
//! is cleared when the job completes or fails.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::defaults::{MAX_TRACKED_JOBS, PROGRESS_PERSIST_STEP};
use crate::error::IngestResult;
use crate::services::store::UploadStore;
use crate::types::{JobFailure, RowError, UploadJob, UploadProgress, UploadResult};

pub struct UploadJobs {
    store: Arc<dyn UploadStore>,
    last_persisted: Mutex<HashMap<Uuid, u8>>,
    max_tracked: usize,
}

impl UploadJobs {
    pub fn new(store: Arc<dyn UploadStore>) -> Self {
        Self::with_capacity(store, MAX_TRACKED_JOBS)
    }

    fn with_capacity(store: Arc<dyn UploadStore>, max_tracked: usize) -> Self {
        Self {
            store,
            last_persisted: Mutex::new(HashMap::new()),
            max_tracked,
        }
    }

    /// Create the pending record for a new upload
    pub async fn create(&self, job_id: Uuid, file_name: &str, file_path: &str) -> IngestResult<UploadJob> {
        let job = UploadJob::new(job_id, file_name, file_path);
        self.store.create(&job).await?;
        info!("Upload job {} created for '{}'", job_id, file_name);
        Ok(job)
    }

    /// Record progress; returns whether the write was persisted
    pub async fn update_progress(&self, job_id: Uuid, progress: UploadProgress) -> IngestResult<bool> {
        let percentage = progress.percentage;

        let (persist, tracked) = {
            let cache = self.last_persisted.lock();
            match cache.get(&job_id) {
                Some(&last) => (Self::should_persist(last, percentage), true),
                None if cache.len() < self.max_tracked => (Self::should_persist(0, percentage), true),
                // Cache full: never lose state, write through untracked
                None => (true, false),
            }
        };

        if !persist {
            debug!("Upload job {} progress {}% throttled", job_id, percentage);
            return Ok(false);
        }

        self.store.write_progress(job_id, progress).await?;
        if tracked {
            self.last_persisted.lock().insert(job_id, percentage);
        }

        debug!(
            "Upload job {} progress {}% ({}/{} rows) persisted",
            job_id, percentage, progress.processed_rows, progress.total_rows
        );
        Ok(true)
    }

    fn should_persist(last: u8, percentage: u8) -> bool {
        percentage == 100 || percentage >= last.saturating_add(PROGRESS_PERSIST_STEP)
    }

    pub async fn complete(&self, job_id: Uuid, result: &UploadResult, errors: &[RowError]) -> IngestResult<()> {
        self.last_persisted.lock().remove(&job_id);
        self.store.complete(job_id, result, errors).await
    }

    pub async fn fail(&self, job_id: Uuid, failure: &JobFailure, errors: &[RowError]) -> IngestResult<()> {
        self.last_persisted.lock().remove(&job_id);
        self.store.fail(job_id, failure, errors).await
    }

    pub async fn get(&self, job_id: Uuid) -> IngestResult<UploadJob> {
        self.store.get(job_id).await
    }

    /// Number of jobs with a cached progress percentage
    #[cfg(test)]
    pub fn tracked_jobs(&self) -> usize {
        self.last_persisted.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::services::store::MemoryStore;
    use crate::types::{FailureKind, UploadStatus};
    use tokio_test::{assert_err, assert_ok};

    fn jobs() -> (Arc<MemoryStore>, UploadJobs) {
        let store = Arc::new(MemoryStore::new());
        let jobs = UploadJobs::new(store.clone());
        (store, jobs)
    }

    #[tokio::test]
    async fn test_throttle_persists_on_ten_point_steps() {
        let (store, jobs) = jobs();
        let job_id = Uuid::new_v4();
        jobs.create(job_id, "a.csv", "/tmp/a.csv").await.unwrap();

        let mut persisted = Vec::new();
        for processed in [3, 7, 12, 22, 100] {
            if jobs.update_progress(job_id, UploadProgress::new(100, processed)).await.unwrap() {
                persisted.push(store.get(job_id).await.unwrap().progress.percentage);
            }
        }

        assert_eq!(persisted, vec![12, 22, 100]);
    }

    #[tokio::test]
    async fn test_first_persisted_write_moves_job_to_processing() {
        let (store, jobs) = jobs();
        let job_id = Uuid::new_v4();
        jobs.create(job_id, "a.csv", "/tmp/a.csv").await.unwrap();

        jobs.update_progress(job_id, UploadProgress::new(100, 5)).await.unwrap();
        assert_eq!(store.get(job_id).await.unwrap().status, UploadStatus::Pending);

        jobs.update_progress(job_id, UploadProgress::new(100, 50)).await.unwrap();
        assert_eq!(store.get(job_id).await.unwrap().status, UploadStatus::Processing);
    }

    #[tokio::test]
    async fn test_terminal_states_clear_cache() {
        let (_, jobs) = jobs();
        let done = Uuid::new_v4();
        let broken = Uuid::new_v4();
        jobs.create(done, "a.csv", "/tmp/a.csv").await.unwrap();
        jobs.create(broken, "b.csv", "/tmp/b.csv").await.unwrap();

        jobs.update_progress(done, UploadProgress::new(10, 5)).await.unwrap();
        jobs.update_progress(broken, UploadProgress::new(10, 5)).await.unwrap();
        assert_eq!(jobs.tracked_jobs(), 2);

        assert_ok!(jobs.complete(done, &UploadResult::default(), &[]).await);
        let failure = IngestError::Persistence("boom".into()).to_failure(None);
        assert_ok!(jobs.fail(broken, &failure, &[]).await);

        assert_eq!(jobs.tracked_jobs(), 0);
        assert_eq!(jobs.get(broken).await.unwrap().failure.unwrap().kind, FailureKind::Persistence);
    }

    #[tokio::test]
    async fn test_full_cache_writes_every_update() {
        let store = Arc::new(MemoryStore::new());
        let jobs = UploadJobs::with_capacity(store.clone(), 1);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        jobs.create(first, "a.csv", "/tmp/a.csv").await.unwrap();
        jobs.create(second, "b.csv", "/tmp/b.csv").await.unwrap();

        assert!(jobs.update_progress(first, UploadProgress::new(100, 20)).await.unwrap());
        assert!(jobs.update_progress(second, UploadProgress::new(100, 1)).await.unwrap());
        assert!(jobs.update_progress(second, UploadProgress::new(100, 2)).await.unwrap());
        assert_eq!(jobs.tracked_jobs(), 1);
        assert_eq!(store.get(second).await.unwrap().progress.percentage, 2);
    }

    #[tokio::test]
    async fn test_completed_job_rejects_further_writes() {
        let (_, jobs) = jobs();
        let job_id = Uuid::new_v4();
        jobs.create(job_id, "a.csv", "/tmp/a.csv").await.unwrap();
        jobs.complete(job_id, &UploadResult::default(), &[]).await.unwrap();

        let failure = IngestError::WorkerCrash("late".into()).to_failure(None);
        assert_err!(jobs.fail(job_id, &failure, &[]).await);
        assert_eq!(jobs.get(job_id).await.unwrap().status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (_, jobs) = jobs();
        let err = jobs.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }
}
