//! Entity writes and natural-key lookups used while ingesting a batch
//!
//! All inserts are insert-if-absent (`ON CONFLICT ... DO NOTHING`) and run on
//! the caller's transaction connection.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDateTime;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::types::{AccountRecord, PolicyRecord, UserDraft};

fn new_ids(count: usize) -> Vec<Uuid> {
    (0..count).map(|_| Uuid::new_v4()).collect()
}

/// Rows sorted by natural key. Concurrent batches take unique-index locks in
/// the same order and cannot deadlock on shared keys.
fn in_key_order<'a, T, K: Ord>(rows: &'a [T], key: impl Fn(&'a T) -> K) -> Vec<&'a T> {
    let mut sorted: Vec<&'a T> = rows.iter().collect();
    sorted.sort_by_key(|row| key(*row));
    sorted
}

// =============================================================================
// NAME-KEYED LEAVES (agents, carriers, categories)
// =============================================================================

/// Leaf tables keyed by a single unique text column
#[derive(Debug, Clone, Copy)]
pub enum NamedTable {
    Agents,
    Carriers,
    Categories,
}

impl NamedTable {
    fn table(&self) -> &'static str {
        match self {
            NamedTable::Agents => "agents",
            NamedTable::Carriers => "carriers",
            NamedTable::Categories => "categories",
        }
    }

    fn key_column(&self) -> &'static str {
        match self {
            NamedTable::Agents => "agent_name",
            NamedTable::Carriers => "company_name",
            NamedTable::Categories => "category_name",
        }
    }
}

/// Insert names that do not exist yet
pub async fn insert_names(conn: &mut PgConnection, table: NamedTable, names: &[String]) -> Result<u64> {
    if names.is_empty() {
        return Ok(0);
    }

    let query = format!(
        "INSERT INTO {table} (id, {key}) \
         SELECT * FROM UNNEST($1::uuid[], $2::text[]) \
         ON CONFLICT ({key}) DO NOTHING",
        table = table.table(),
        key = table.key_column(),
    );

    let names: Vec<&str> = in_key_order(names, |name| name.as_str())
        .into_iter()
        .map(String::as_str)
        .collect();

    let result = sqlx::query(&query)
        .bind(new_ids(names.len()))
        .bind(names)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

/// Map of name -> id for the given names
pub async fn find_name_ids(conn: &mut PgConnection, table: NamedTable, names: &[String]) -> Result<HashMap<String, Uuid>> {
    if names.is_empty() {
        return Ok(HashMap::new());
    }

    let query = format!(
        "SELECT {key}, id FROM {table} WHERE {key} = ANY($1)",
        table = table.table(),
        key = table.key_column(),
    );

    let rows: Vec<(String, Uuid)> = sqlx::query_as(&query)
        .bind(names)
        .fetch_all(conn)
        .await?;

    Ok(rows.into_iter().collect())
}

// =============================================================================
// USERS
// =============================================================================

pub async fn insert_users(conn: &mut PgConnection, users: &[UserDraft]) -> Result<u64> {
    if users.is_empty() {
        return Ok(0);
    }

    let users = in_key_order(users, |u| u.email.as_str());
    let emails: Vec<&str> = users.iter().map(|u| u.email.as_str()).collect();
    let first_names: Vec<Option<&str>> = users.iter().map(|u| u.first_name.as_deref()).collect();
    let dobs: Vec<Option<NaiveDateTime>> = users.iter().map(|u| u.dob).collect();
    let addresses: Vec<Option<&str>> = users.iter().map(|u| u.address.as_deref()).collect();
    let phones: Vec<Option<&str>> = users.iter().map(|u| u.phone.as_deref()).collect();
    let states: Vec<Option<&str>> = users.iter().map(|u| u.state.as_deref()).collect();
    let zip_codes: Vec<Option<&str>> = users.iter().map(|u| u.zip_code.as_deref()).collect();
    let genders: Vec<Option<&str>> = users.iter().map(|u| u.gender.as_deref()).collect();
    let user_types: Vec<Option<&str>> = users.iter().map(|u| u.user_type.as_deref()).collect();

    let result = sqlx::query(
        r#"
        INSERT INTO users (id, email, first_name, dob, address, phone, state, zip_code, gender, user_type)
        SELECT * FROM UNNEST(
            $1::uuid[], $2::text[], $3::text[], $4::timestamp[], $5::text[],
            $6::text[], $7::text[], $8::text[], $9::text[], $10::text[]
        )
        ON CONFLICT (email) DO NOTHING
        "#,
    )
    .bind(new_ids(users.len()))
    .bind(emails)
    .bind(first_names)
    .bind(dobs)
    .bind(addresses)
    .bind(phones)
    .bind(states)
    .bind(zip_codes)
    .bind(genders)
    .bind(user_types)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn find_user_ids(conn: &mut PgConnection, emails: &[String]) -> Result<HashMap<String, Uuid>> {
    if emails.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(String, Uuid)> = sqlx::query_as(
        "SELECT email, id FROM users WHERE email = ANY($1)"
    )
    .bind(emails)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().collect())
}

// =============================================================================
// ACCOUNTS
// =============================================================================

pub async fn insert_accounts(conn: &mut PgConnection, accounts: &[AccountRecord]) -> Result<u64> {
    if accounts.is_empty() {
        return Ok(0);
    }

    let accounts = in_key_order(accounts, |a| (a.account_name.as_str(), a.user_id));
    let names: Vec<&str> = accounts.iter().map(|a| a.account_name.as_str()).collect();
    let user_ids: Vec<Uuid> = accounts.iter().map(|a| a.user_id).collect();

    let result = sqlx::query(
        r#"
        INSERT INTO accounts (id, account_name, user_id)
        SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::uuid[])
        ON CONFLICT (account_name, user_id) DO NOTHING
        "#,
    )
    .bind(new_ids(accounts.len()))
    .bind(names)
    .bind(user_ids)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn find_account_ids(conn: &mut PgConnection, accounts: &[AccountRecord]) -> Result<HashMap<(String, Uuid), Uuid>> {
    if accounts.is_empty() {
        return Ok(HashMap::new());
    }

    let names: Vec<&str> = accounts.iter().map(|a| a.account_name.as_str()).collect();
    let user_ids: Vec<Uuid> = accounts.iter().map(|a| a.user_id).collect();

    let rows: Vec<(String, Uuid, Uuid)> = sqlx::query_as(
        r#"
        SELECT a.account_name, a.user_id, a.id
        FROM accounts a
        JOIN UNNEST($1::text[], $2::uuid[]) AS k(account_name, user_id)
          ON a.account_name = k.account_name AND a.user_id = k.user_id
        "#,
    )
    .bind(names)
    .bind(user_ids)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|(name, user_id, id)| ((name, user_id), id)).collect())
}

// =============================================================================
// POLICIES
// =============================================================================

pub async fn insert_policies(conn: &mut PgConnection, policies: &[PolicyRecord]) -> Result<u64> {
    if policies.is_empty() {
        return Ok(0);
    }

    let policies = in_key_order(policies, |p| (p.policy_number.as_str(), p.company_id));
    let numbers: Vec<&str> = policies.iter().map(|p| p.policy_number.as_str()).collect();
    let starts: Vec<Option<NaiveDateTime>> = policies.iter().map(|p| p.policy_start_date).collect();
    let ends: Vec<Option<NaiveDateTime>> = policies.iter().map(|p| p.policy_end_date).collect();
    let category_ids: Vec<Uuid> = policies.iter().map(|p| p.category_id).collect();
    let company_ids: Vec<Uuid> = policies.iter().map(|p| p.company_id).collect();
    let user_ids: Vec<Uuid> = policies.iter().map(|p| p.user_id).collect();

    let result = sqlx::query(
        r#"
        INSERT INTO policies (id, policy_number, policy_start_date, policy_end_date,
            category_id, company_id, user_id)
        SELECT * FROM UNNEST(
            $1::uuid[], $2::text[], $3::timestamp[], $4::timestamp[],
            $5::uuid[], $6::uuid[], $7::uuid[]
        )
        ON CONFLICT (policy_number, company_id) DO NOTHING
        "#,
    )
    .bind(new_ids(policies.len()))
    .bind(numbers)
    .bind(starts)
    .bind(ends)
    .bind(category_ids)
    .bind(company_ids)
    .bind(user_ids)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn find_policy_ids(conn: &mut PgConnection, policies: &[PolicyRecord]) -> Result<HashMap<(String, Uuid), Uuid>> {
    if policies.is_empty() {
        return Ok(HashMap::new());
    }

    let numbers: Vec<&str> = policies.iter().map(|p| p.policy_number.as_str()).collect();
    let company_ids: Vec<Uuid> = policies.iter().map(|p| p.company_id).collect();

    let rows: Vec<(String, Uuid, Uuid)> = sqlx::query_as(
        r#"
        SELECT p.policy_number, p.company_id, p.id
        FROM policies p
        JOIN UNNEST($1::text[], $2::uuid[]) AS k(policy_number, company_id)
          ON p.policy_number = k.policy_number AND p.company_id = k.company_id
        "#,
    )
    .bind(numbers)
    .bind(company_ids)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|(number, company_id, id)| ((number, company_id), id)).collect())
}
