//! In-memory store
//!
//! A transaction holds the entity lock for its whole lifetime and works on a
//! staged copy of the tables, swapped in on commit. Transactions are therefore
//! serialized and a rolled-back batch leaves no trace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{AccountKey, IngestBackend, IngestSession, IngestTx, PolicyKey, UploadStore};
use crate::error::{IngestError, IngestResult};
use crate::types::{
    AccountRecord, AgentDraft, CarrierDraft, CategoryDraft, JobFailure, PolicyRecord, RowError,
    UploadJob, UploadProgress, UploadResult, UploadStatus, UserDraft,
};

/// Entity tables keyed by natural key
#[derive(Debug, Clone, Default)]
pub struct EntityTables {
    pub agents: HashMap<String, Uuid>,
    pub users: HashMap<String, (Uuid, UserDraft)>,
    pub carriers: HashMap<String, Uuid>,
    pub categories: HashMap<String, Uuid>,
    pub accounts: HashMap<AccountKey, Uuid>,
    pub policies: HashMap<PolicyKey, (Uuid, PolicyRecord)>,
}

fn insert_if_absent<K, V>(table: &mut HashMap<K, V>, key: K, value: impl FnOnce() -> V)
where
    K: std::hash::Hash + Eq,
{
    table.entry(key).or_insert_with(value);
}

fn lookup<K, V, F>(table: &HashMap<K, V>, keys: impl Iterator<Item = K>, id: F) -> HashMap<K, Uuid>
where
    K: std::hash::Hash + Eq,
    F: Fn(&V) -> Uuid,
{
    keys.filter_map(|k| {
        let found = table.get(&k).map(&id);
        found.map(|uuid| (k, uuid))
    })
    .collect()
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<AsyncMutex<EntityTables>>,
    uploads: Mutex<HashMap<Uuid, UploadJob>>,
    fail_account_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every account insert fail until switched off
    #[cfg(test)]
    pub fn fail_account_writes(&self, fail: bool) {
        self.fail_account_writes.store(fail, Ordering::SeqCst);
    }

    /// Committed entity tables
    #[cfg(test)]
    pub async fn snapshot(&self) -> EntityTables {
        self.tables.lock().await.clone()
    }

    /// Apply `update` to a non-terminal job moving it to `next`
    fn transition<F>(&self, job_id: Uuid, next: UploadStatus, update: F) -> IngestResult<()>
    where
        F: FnOnce(&mut UploadJob),
    {
        let mut uploads = self.uploads.lock();
        let job = uploads.get_mut(&job_id).ok_or(IngestError::NotFound(job_id))?;
        if !job.status.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: job.status,
                to: next,
            });
        }
        job.status = next;
        job.updated_at = Utc::now();
        update(job);
        Ok(())
    }
}

#[async_trait]
impl IngestBackend for MemoryStore {
    async fn connect(&self) -> IngestResult<Box<dyn IngestSession>> {
        Ok(Box::new(MemorySession {
            tables: Arc::clone(&self.tables),
            fail_account_writes: Arc::clone(&self.fail_account_writes),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    tables: Arc<AsyncMutex<EntityTables>>,
    fail_account_writes: Arc<AtomicBool>,
}

#[async_trait]
impl IngestSession for MemorySession {
    async fn begin(&self) -> IngestResult<Box<dyn IngestTx>> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            staged,
            fail_account_writes: self.fail_account_writes.load(Ordering::SeqCst),
        }))
    }

    async fn close(self: Box<Self>) {}
}

struct MemoryTx {
    guard: OwnedMutexGuard<EntityTables>,
    staged: EntityTables,
    fail_account_writes: bool,
}

#[async_trait]
impl IngestTx for MemoryTx {
    async fn insert_agents(&mut self, agents: &[AgentDraft]) -> IngestResult<()> {
        for agent in agents {
            insert_if_absent(&mut self.staged.agents, agent.agent_name.clone(), Uuid::new_v4);
        }
        Ok(())
    }

    async fn agent_ids(&mut self, names: &[String]) -> IngestResult<HashMap<String, Uuid>> {
        Ok(lookup(&self.staged.agents, names.iter().cloned(), |id| *id))
    }

    async fn insert_users(&mut self, users: &[UserDraft]) -> IngestResult<()> {
        for user in users {
            insert_if_absent(&mut self.staged.users, user.email.clone(), || {
                (Uuid::new_v4(), user.clone())
            });
        }
        Ok(())
    }

    async fn user_ids(&mut self, emails: &[String]) -> IngestResult<HashMap<String, Uuid>> {
        Ok(lookup(&self.staged.users, emails.iter().cloned(), |(id, _)| *id))
    }

    async fn insert_carriers(&mut self, carriers: &[CarrierDraft]) -> IngestResult<()> {
        for carrier in carriers {
            insert_if_absent(&mut self.staged.carriers, carrier.company_name.clone(), Uuid::new_v4);
        }
        Ok(())
    }

    async fn carrier_ids(&mut self, names: &[String]) -> IngestResult<HashMap<String, Uuid>> {
        Ok(lookup(&self.staged.carriers, names.iter().cloned(), |id| *id))
    }

    async fn insert_categories(&mut self, categories: &[CategoryDraft]) -> IngestResult<()> {
        for category in categories {
            insert_if_absent(&mut self.staged.categories, category.category_name.clone(), Uuid::new_v4);
        }
        Ok(())
    }

    async fn category_ids(&mut self, names: &[String]) -> IngestResult<HashMap<String, Uuid>> {
        Ok(lookup(&self.staged.categories, names.iter().cloned(), |id| *id))
    }

    async fn insert_accounts(&mut self, accounts: &[AccountRecord]) -> IngestResult<()> {
        if self.fail_account_writes {
            return Err(IngestError::Persistence("account insert rejected".to_string()));
        }
        for account in accounts {
            let key = (account.account_name.clone(), account.user_id);
            insert_if_absent(&mut self.staged.accounts, key, Uuid::new_v4);
        }
        Ok(())
    }

    async fn account_ids(&mut self, accounts: &[AccountRecord]) -> IngestResult<HashMap<AccountKey, Uuid>> {
        let keys = accounts.iter().map(|a| (a.account_name.clone(), a.user_id));
        Ok(lookup(&self.staged.accounts, keys, |id| *id))
    }

    async fn insert_policies(&mut self, policies: &[PolicyRecord]) -> IngestResult<()> {
        for policy in policies {
            let key = (policy.policy_number.clone(), policy.company_id);
            insert_if_absent(&mut self.staged.policies, key, || {
                (Uuid::new_v4(), policy.clone())
            });
        }
        Ok(())
    }

    async fn policy_ids(&mut self, policies: &[PolicyRecord]) -> IngestResult<HashMap<PolicyKey, Uuid>> {
        let keys = policies.iter().map(|p| (p.policy_number.clone(), p.company_id));
        Ok(lookup(&self.staged.policies, keys, |(id, _)| *id))
    }

    async fn commit(self: Box<Self>) -> IngestResult<()> {
        let MemoryTx { mut guard, staged, .. } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> IngestResult<()> {
        Ok(())
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn create(&self, job: &UploadJob) -> IngestResult<()> {
        let mut uploads = self.uploads.lock();
        if uploads.contains_key(&job.job_id) {
            return Err(IngestError::Persistence(format!(
                "upload job {} already exists",
                job.job_id
            )));
        }
        uploads.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn write_progress(&self, job_id: Uuid, progress: UploadProgress) -> IngestResult<()> {
        self.transition(job_id, UploadStatus::Processing, |job| {
            job.progress = progress;
        })
    }

    async fn complete(&self, job_id: Uuid, result: &UploadResult, errors: &[RowError]) -> IngestResult<()> {
        self.transition(job_id, UploadStatus::Completed, |job| {
            job.result = Some(result.clone());
            job.errors = errors.to_vec();
            job.completed_at = Some(Utc::now());
        })
    }

    async fn fail(&self, job_id: Uuid, failure: &JobFailure, errors: &[RowError]) -> IngestResult<()> {
        self.transition(job_id, UploadStatus::Failed, |job| {
            job.failure = Some(failure.clone());
            job.errors = errors.to_vec();
            job.failed_at = Some(Utc::now());
        })
    }

    async fn get(&self, job_id: Uuid) -> IngestResult<UploadJob> {
        self.uploads
            .lock()
            .get(&job_id)
            .cloned()
            .ok_or(IngestError::NotFound(job_id))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> AgentDraft {
        AgentDraft {
            agent_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_no_rows() {
        let store = MemoryStore::new();
        let session = store.connect().await.unwrap();

        let mut tx = session.begin().await.unwrap();
        tx.insert_agents(&[agent("A1")]).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.snapshot().await.agents.is_empty());
    }

    #[tokio::test]
    async fn test_committed_transaction_is_visible() {
        let store = MemoryStore::new();
        let session = store.connect().await.unwrap();

        let mut tx = session.begin().await.unwrap();
        tx.insert_agents(&[agent("A1"), agent("A1")]).await.unwrap();
        let ids = tx.agent_ids(&["A1".to_string(), "nobody".to_string()]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(ids.len(), 1);
        assert_eq!(store.snapshot().await.agents.get("A1"), ids.get("A1"));
    }

    #[tokio::test]
    async fn test_job_record_transitions() {
        let store = MemoryStore::new();
        let job = UploadJob::new(Uuid::new_v4(), "a.csv", "/tmp/a.csv");
        store.create(&job).await.unwrap();

        store
            .write_progress(job.job_id, UploadProgress::new(10, 5))
            .await
            .unwrap();
        assert_eq!(store.get(job.job_id).await.unwrap().status, UploadStatus::Processing);

        store
            .complete(job.job_id, &UploadResult::default(), &[])
            .await
            .unwrap();

        let err = store
            .write_progress(job.job_id, UploadProgress::new(10, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidTransition { .. }));

        let stored = store.get(job.job_id).await.unwrap();
        assert_eq!(stored.status, UploadStatus::Completed);
        assert_eq!(stored.progress.processed_rows, 5);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_job_id_rejected() {
        let store = MemoryStore::new();
        let job = UploadJob::new(Uuid::new_v4(), "a.csv", "/tmp/a.csv");
        store.create(&job).await.unwrap();
        assert!(store.create(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let store = MemoryStore::new();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }
}
