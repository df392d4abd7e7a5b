//! PostgreSQL store

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::{AccountKey, IngestBackend, IngestSession, IngestTx, PolicyKey, UploadStore};
use crate::db;
use crate::db::queries::ingest::{self as queries, NamedTable};
use crate::db::queries::upload as upload_queries;
use crate::error::{IngestError, IngestResult};
use crate::types::{
    AccountRecord, AgentDraft, CarrierDraft, CategoryDraft, JobFailure, PolicyRecord, RowError,
    UploadJob, UploadProgress, UploadResult, UploadStatus, UserDraft,
};

fn persistence(e: anyhow::Error) -> IngestError {
    IngestError::Persistence(format!("{:#}", e))
}

// =============================================================================
// Entity backend
// =============================================================================

/// Opens one dedicated connection per worker session
pub struct PgIngestBackend {
    database_url: String,
}

impl PgIngestBackend {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl IngestBackend for PgIngestBackend {
    async fn connect(&self) -> IngestResult<Box<dyn IngestSession>> {
        let pool = db::create_session_pool(&self.database_url)
            .await
            .map_err(persistence)?;
        debug!("Opened worker database session");
        Ok(Box::new(PgSession { pool }))
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

struct PgSession {
    pool: PgPool,
}

#[async_trait]
impl IngestSession for PgSession {
    async fn begin(&self) -> IngestResult<Box<dyn IngestTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn close(self: Box<Self>) {
        self.pool.close().await;
        debug!("Closed worker database session");
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn natural_keys<T>(items: &[T], name: impl Fn(&T) -> &String) -> Vec<String> {
    items.iter().map(|item| name(item).clone()).collect()
}

#[async_trait]
impl IngestTx for PgTx {
    async fn insert_agents(&mut self, agents: &[AgentDraft]) -> IngestResult<()> {
        let names = natural_keys(agents, |a| &a.agent_name);
        let inserted = queries::insert_names(&mut self.tx, NamedTable::Agents, &names)
            .await
            .map_err(persistence)?;
        debug!("Inserted {} new agents", inserted);
        Ok(())
    }

    async fn agent_ids(&mut self, names: &[String]) -> IngestResult<HashMap<String, Uuid>> {
        queries::find_name_ids(&mut self.tx, NamedTable::Agents, names)
            .await
            .map_err(persistence)
    }

    async fn insert_users(&mut self, users: &[UserDraft]) -> IngestResult<()> {
        let inserted = queries::insert_users(&mut self.tx, users)
            .await
            .map_err(persistence)?;
        debug!("Inserted {} new users", inserted);
        Ok(())
    }

    async fn user_ids(&mut self, emails: &[String]) -> IngestResult<HashMap<String, Uuid>> {
        queries::find_user_ids(&mut self.tx, emails)
            .await
            .map_err(persistence)
    }

    async fn insert_carriers(&mut self, carriers: &[CarrierDraft]) -> IngestResult<()> {
        let names = natural_keys(carriers, |c| &c.company_name);
        let inserted = queries::insert_names(&mut self.tx, NamedTable::Carriers, &names)
            .await
            .map_err(persistence)?;
        debug!("Inserted {} new carriers", inserted);
        Ok(())
    }

    async fn carrier_ids(&mut self, names: &[String]) -> IngestResult<HashMap<String, Uuid>> {
        queries::find_name_ids(&mut self.tx, NamedTable::Carriers, names)
            .await
            .map_err(persistence)
    }

    async fn insert_categories(&mut self, categories: &[CategoryDraft]) -> IngestResult<()> {
        let names = natural_keys(categories, |c| &c.category_name);
        let inserted = queries::insert_names(&mut self.tx, NamedTable::Categories, &names)
            .await
            .map_err(persistence)?;
        debug!("Inserted {} new categories", inserted);
        Ok(())
    }

    async fn category_ids(&mut self, names: &[String]) -> IngestResult<HashMap<String, Uuid>> {
        queries::find_name_ids(&mut self.tx, NamedTable::Categories, names)
            .await
            .map_err(persistence)
    }

    async fn insert_accounts(&mut self, accounts: &[AccountRecord]) -> IngestResult<()> {
        let inserted = queries::insert_accounts(&mut self.tx, accounts)
            .await
            .map_err(persistence)?;
        debug!("Inserted {} new accounts", inserted);
        Ok(())
    }

    async fn account_ids(&mut self, accounts: &[AccountRecord]) -> IngestResult<HashMap<AccountKey, Uuid>> {
        queries::find_account_ids(&mut self.tx, accounts)
            .await
            .map_err(persistence)
    }

    async fn insert_policies(&mut self, policies: &[PolicyRecord]) -> IngestResult<()> {
        let inserted = queries::insert_policies(&mut self.tx, policies)
            .await
            .map_err(persistence)?;
        debug!("Inserted {} new policies", inserted);
        Ok(())
    }

    async fn policy_ids(&mut self, policies: &[PolicyRecord]) -> IngestResult<HashMap<PolicyKey, Uuid>> {
        queries::find_policy_ids(&mut self.tx, policies)
            .await
            .map_err(persistence)
    }

    async fn commit(self: Box<Self>) -> IngestResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> IngestResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// =============================================================================
// Upload job records
// =============================================================================

pub struct PgUploadStore {
    pool: PgPool,
}

impl PgUploadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded update touched no row
    async fn rejected(&self, job_id: Uuid, next: UploadStatus) -> IngestError {
        match upload_queries::get_upload(&self.pool, job_id).await {
            Ok(Some(job)) => IngestError::InvalidTransition {
                from: job.status,
                to: next,
            },
            Ok(None) => IngestError::NotFound(job_id),
            Err(e) => persistence(e),
        }
    }
}

#[async_trait]
impl UploadStore for PgUploadStore {
    async fn create(&self, job: &UploadJob) -> IngestResult<()> {
        upload_queries::insert_upload(&self.pool, job)
            .await
            .map_err(persistence)
    }

    async fn write_progress(&self, job_id: Uuid, progress: UploadProgress) -> IngestResult<()> {
        let updated = upload_queries::update_progress(&self.pool, job_id, progress)
            .await
            .map_err(persistence)?;
        if !updated {
            return Err(self.rejected(job_id, UploadStatus::Processing).await);
        }
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, result: &UploadResult, errors: &[RowError]) -> IngestResult<()> {
        let updated = upload_queries::complete_upload(&self.pool, job_id, result, errors)
            .await
            .map_err(persistence)?;
        if !updated {
            return Err(self.rejected(job_id, UploadStatus::Completed).await);
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, failure: &JobFailure, errors: &[RowError]) -> IngestResult<()> {
        let updated = upload_queries::fail_upload(&self.pool, job_id, failure, errors)
            .await
            .map_err(persistence)?;
        if !updated {
            return Err(self.rejected(job_id, UploadStatus::Failed).await);
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> IngestResult<UploadJob> {
        upload_queries::get_upload(&self.pool, job_id)
            .await
            .map_err(persistence)?
            .ok_or(IngestError::NotFound(job_id))
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
