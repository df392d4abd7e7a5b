//! Reference resolution and batch persistence
//!
//! One normalized batch is written inside a single transaction on the
//! worker's session. Leaf entities (agents, users, carriers, categories) go
//! first, their ids are read back by natural key, and those ids are wired
//! into accounts and policies before they are written. Any storage error
//! rolls the whole batch back.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::IngestResult;
use crate::services::store::{IngestSession, IngestTx};
use crate::types::{AccountRecord, BatchOutcome, NormalizedBatch, PolicyRecord, RowError};

/// Persist one batch atomically and report the ids it touched
pub async fn persist_batch(session: &dyn IngestSession, batch: &NormalizedBatch) -> IngestResult<BatchOutcome> {
    let mut tx = session.begin().await?;

    match write_batch(tx.as_mut(), batch).await {
        Ok(outcome) => {
            tx.commit().await?;
            Ok(outcome)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed after batch error: {}", rollback_err);
            }
            Err(e)
        }
    }
}

async fn write_batch(tx: &mut dyn IngestTx, batch: &NormalizedBatch) -> IngestResult<BatchOutcome> {
    let mut outcome = BatchOutcome::default();

    // Leaves
    tx.insert_agents(&batch.agents).await?;
    tx.insert_users(&batch.users).await?;
    tx.insert_carriers(&batch.carriers).await?;
    tx.insert_categories(&batch.categories).await?;

    let agent_names: Vec<String> = batch.agents.iter().map(|a| a.agent_name.clone()).collect();
    let emails: Vec<String> = batch.users.iter().map(|u| u.email.clone()).collect();
    let carrier_names: Vec<String> = batch.carriers.iter().map(|c| c.company_name.clone()).collect();
    let category_names: Vec<String> = batch.categories.iter().map(|c| c.category_name.clone()).collect();

    let agent_ids = tx.agent_ids(&agent_names).await?;
    let user_ids = tx.user_ids(&emails).await?;
    let carrier_ids = tx.carrier_ids(&carrier_names).await?;
    let category_ids = tx.category_ids(&category_names).await?;

    outcome.agent_ids = agent_ids.values().copied().collect();
    outcome.user_ids = user_ids.values().copied().collect();
    outcome.carrier_ids = carrier_ids.values().copied().collect();
    outcome.category_ids = category_ids.values().copied().collect();

    // Accounts
    let mut accounts = Vec::with_capacity(batch.accounts.len());
    for draft in &batch.accounts {
        match user_ids.get(&draft.user_email) {
            Some(&user_id) => accounts.push(AccountRecord {
                account_name: draft.account_name.clone(),
                user_id,
            }),
            None => outcome
                .row_errors
                .push(RowError::new(draft.row, format!("unresolved user '{}'", draft.user_email))),
        }
    }

    tx.insert_accounts(&accounts).await?;
    outcome.account_ids = tx.account_ids(&accounts).await?.into_values().collect();

    // Policies
    let mut policies = Vec::with_capacity(batch.policies.len());
    for draft in &batch.policies {
        let resolved = resolve(&category_ids, &draft.category_name, "category")
            .and_then(|category_id| {
                let company_id = resolve(&carrier_ids, &draft.company_name, "carrier")?;
                let user_id = resolve(&user_ids, &draft.user_email, "user")?;
                Ok((category_id, company_id, user_id))
            });

        match resolved {
            Ok((category_id, company_id, user_id)) => policies.push(PolicyRecord {
                policy_number: draft.policy_number.clone(),
                policy_start_date: draft.policy_start_date,
                policy_end_date: draft.policy_end_date,
                category_id,
                company_id,
                user_id,
            }),
            Err(message) => outcome.row_errors.push(RowError::new(draft.row, message)),
        }
    }

    tx.insert_policies(&policies).await?;
    outcome.policy_ids = tx.policy_ids(&policies).await?.into_values().collect();

    debug!(
        "Batch written: {} agents, {} users, {} accounts, {} carriers, {} categories, {} policies",
        outcome.agent_ids.len(),
        outcome.user_ids.len(),
        outcome.account_ids.len(),
        outcome.carrier_ids.len(),
        outcome.category_ids.len(),
        outcome.policy_ids.len(),
    );

    Ok(outcome)
}

fn resolve(ids: &HashMap<String, Uuid>, key: &str, kind: &str) -> Result<Uuid, String> {
    ids.get(key)
        .copied()
        .ok_or_else(|| format!("unresolved {} '{}'", kind, key))
}
