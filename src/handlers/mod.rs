//! NATS message handlers

pub mod upload;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use tokio::select;
use tracing::{error, info};

use crate::config::Config;
use crate::services::orchestrator::UploadOrchestrator;

pub const SUBJECT_UPLOAD_SUBMIT: &str = "ingest.upload.submit";
pub const SUBJECT_UPLOAD_STATUS: &str = "ingest.upload.status";

/// Start all message handlers; returns when one of them stops
pub async fn start_handlers(client: Client, orchestrator: Arc<UploadOrchestrator>, config: &Config) -> Result<()> {
    info!("Starting message handlers...");

    let submit_sub = client.subscribe(SUBJECT_UPLOAD_SUBMIT).await?;
    let status_sub = client.subscribe(SUBJECT_UPLOAD_STATUS).await?;

    let submit_handle = tokio::spawn(upload::handle_upload_submit(
        client.clone(),
        submit_sub,
        Arc::clone(&orchestrator),
        config.max_upload_bytes,
    ));
    let status_handle = tokio::spawn(upload::handle_upload_status(
        client.clone(),
        status_sub,
        orchestrator,
    ));

    info!(
        "Listening on {} and {}",
        SUBJECT_UPLOAD_SUBMIT, SUBJECT_UPLOAD_STATUS
    );

    select! {
        result = submit_handle => {
            error!("Upload submit handler finished: {:?}", result);
        }
        result = status_handle => {
            error!("Upload status handler finished: {:?}", result);
        }
    }

    Ok(())
}
