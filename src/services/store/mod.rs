//! Storage abstraction for ingested entities and upload job records
//!
//! - `PgIngestBackend` / `PgUploadStore` for production (PostgreSQL)
//! - `MemoryStore` for development and tests (nothing survives a restart)
//!
//! Selected via `STORE_BACKEND`.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgIngestBackend, PgUploadStore};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, StoreBackend};
use crate::db;
use crate::error::IngestResult;
use crate::types::{
    AccountRecord, AgentDraft, CarrierDraft, CategoryDraft, JobFailure, PolicyRecord, RowError,
    UploadJob, UploadProgress, UploadResult, UserDraft,
};

/// Natural key of an account: (account name, owning user id)
pub type AccountKey = (String, Uuid);

/// Natural key of a policy: (policy number, carrier id)
pub type PolicyKey = (String, Uuid);

/// Entity store used by upload workers
#[async_trait]
pub trait IngestBackend: Send + Sync {
    /// Open a session owned by a single worker
    async fn connect(&self) -> IngestResult<Box<dyn IngestSession>>;

    /// Get the name of this backend for logging
    fn name(&self) -> &'static str;
}

/// A worker's own connection to the entity store
#[async_trait]
pub trait IngestSession: Send + Sync {
    /// Start the transaction for one batch
    async fn begin(&self) -> IngestResult<Box<dyn IngestTx>>;

    /// Release the session
    async fn close(self: Box<Self>);
}

/// One batch transaction. Every `insert_*` is insert-if-absent on the
/// entity's natural key and never touches existing rows.
#[async_trait]
pub trait IngestTx: Send {
    async fn insert_agents(&mut self, agents: &[AgentDraft]) -> IngestResult<()>;
    async fn agent_ids(&mut self, names: &[String]) -> IngestResult<HashMap<String, Uuid>>;

    async fn insert_users(&mut self, users: &[UserDraft]) -> IngestResult<()>;
    async fn user_ids(&mut self, emails: &[String]) -> IngestResult<HashMap<String, Uuid>>;

    async fn insert_carriers(&mut self, carriers: &[CarrierDraft]) -> IngestResult<()>;
    async fn carrier_ids(&mut self, names: &[String]) -> IngestResult<HashMap<String, Uuid>>;

    async fn insert_categories(&mut self, categories: &[CategoryDraft]) -> IngestResult<()>;
    async fn category_ids(&mut self, names: &[String]) -> IngestResult<HashMap<String, Uuid>>;

    async fn insert_accounts(&mut self, accounts: &[AccountRecord]) -> IngestResult<()>;
    async fn account_ids(&mut self, accounts: &[AccountRecord]) -> IngestResult<HashMap<AccountKey, Uuid>>;

    async fn insert_policies(&mut self, policies: &[PolicyRecord]) -> IngestResult<()>;
    async fn policy_ids(&mut self, policies: &[PolicyRecord]) -> IngestResult<HashMap<PolicyKey, Uuid>>;

    async fn commit(self: Box<Self>) -> IngestResult<()>;
    async fn rollback(self: Box<Self>) -> IngestResult<()>;
}

/// Persisted upload job records.
///
/// Writes only apply to jobs that are not yet completed or failed; a write
/// against a terminal job returns `InvalidTransition`, a missing job `NotFound`.
#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn create(&self, job: &UploadJob) -> IngestResult<()>;

    /// Store progress and move the job to `processing`
    async fn write_progress(&self, job_id: Uuid, progress: UploadProgress) -> IngestResult<()>;

    async fn complete(&self, job_id: Uuid, result: &UploadResult, errors: &[RowError]) -> IngestResult<()>;

    async fn fail(&self, job_id: Uuid, failure: &JobFailure, errors: &[RowError]) -> IngestResult<()>;

    async fn get(&self, job_id: Uuid) -> IngestResult<UploadJob>;

    fn name(&self) -> &'static str;
}

/// Backends chosen at startup
pub struct Stores {
    pub ingest: Arc<dyn IngestBackend>,
    pub uploads: Arc<dyn UploadStore>,
}

/// Build the configured stores. The postgres backend runs migrations first.
pub async fn create_stores(config: &Config) -> Result<Stores> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .clone()
                .context("DATABASE_URL must be set for the postgres backend")?;

            let pool = db::create_pool(&database_url).await?;
            info!("Connected to PostgreSQL");

            db::run_migrations(&pool).await?;

            Ok(Stores {
                ingest: Arc::new(PgIngestBackend::new(database_url)),
                uploads: Arc::new(PgUploadStore::new(pool)),
            })
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store, uploads will not survive a restart");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                ingest: store.clone(),
                uploads: store,
            })
        }
    }
}
