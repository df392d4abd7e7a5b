//! Database module

pub mod queries;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Connections held by the shared pool (job records, status queries)
const SHARED_POOL_SIZE: u32 = 10;

/// Create the shared connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    connect(database_url, SHARED_POOL_SIZE).await
}

/// Create a single-connection pool owned by one upload worker
pub async fn create_session_pool(database_url: &str) -> Result<PgPool> {
    connect(database_url, 1).await
}

async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    let migrator = sqlx::migrate!("./migrations");
    let versions: Vec<i64> = migrator
        .iter()
        .filter(|m| !m.migration_type.is_down_migration())
        .map(|m| m.version)
        .collect();
    info!("Compiled migration versions: {:?}", versions);

    migrator.run(pool).await?;

    info!("Database migrations complete");
    Ok(())
}
