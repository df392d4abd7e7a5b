//! Policy Ingest Worker - imports insurance policy spreadsheets
//!
//! The worker connects to NATS, accepts upload submissions and processes each
//! one in its own background task while clients poll the job status.

mod cli;
mod config;
mod db;
mod defaults;
mod error;
mod handlers;
mod services;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::error::IngestError;
use crate::services::orchestrator::UploadOrchestrator;
use crate::services::store::create_stores;
use crate::services::upload_jobs::UploadJobs;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs directory - use LOGS_DIR env var or default to ../logs (relative to worker)
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "ingest-worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,policy_ingest_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    let config = Config::from_env()?;
    info!("Configuration loaded ({:?} store)", config.store_backend);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::Migrate => migrate(&config).await,
        Command::Import { file } => import(&config, &file).await,
    }
}

fn build_orchestrator(stores: services::store::Stores, config: &Config) -> Arc<UploadOrchestrator> {
    info!(
        "Stores initialized: entities={}, uploads={}",
        stores.ingest.name(),
        stores.uploads.name()
    );
    let jobs = Arc::new(UploadJobs::new(stores.uploads));
    Arc::new(UploadOrchestrator::new(jobs, stores.ingest, config.batch_size))
}

async fn serve(config: &Config) -> Result<()> {
    info!("Starting Policy Ingest Worker...");

    let stores = create_stores(config).await?;
    let orchestrator = build_orchestrator(stores, config);

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    let handler_result = handlers::start_handlers(nats_client, orchestrator, config).await;

    if let Err(e) = handler_result {
        error!("Handler error: {}", e);
        return Err(e);
    }

    Ok(())
}

async fn migrate(config: &Config) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to run migrations")?;

    let pool = db::create_pool(database_url).await?;
    info!("Connected to PostgreSQL");
    db::run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}

async fn import(config: &Config, file: &Path) -> Result<()> {
    let stores = create_stores(config).await?;
    let orchestrator = build_orchestrator(stores, config);

    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());

    let handle = orchestrator.submit(None, file, &file_name).await?;
    let job_id = handle.job_id;

    let outcome = handle.wait().await;
    let job = orchestrator.status(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);

    match outcome {
        Ok(_) => Ok(()),
        Err(IngestError::JobFailed { failure, .. }) => {
            anyhow::bail!("upload job {} failed ({:?}): {}", job_id, failure.kind, failure.message)
        }
        Err(e) => Err(e.into()),
    }
}
