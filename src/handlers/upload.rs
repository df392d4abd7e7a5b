//! Upload submit and status handlers

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::IngestError;
use crate::services::orchestrator::UploadOrchestrator;
use crate::services::spreadsheet::supported_extension;
use crate::types::{
    ErrorResponse, Request, SubmitUploadRequest, SubmitUploadResponse, SuccessResponse,
    UploadStatusRequest, UploadStatusResponse,
};

/// Rejection of a submit request before any job is created
#[derive(Debug, PartialEq, Eq)]
struct Rejection {
    code: &'static str,
    message: String,
}

/// Check an uploaded file before it becomes a job
fn validate_upload(path: &Path, max_bytes: u64) -> std::result::Result<(), Rejection> {
    if supported_extension(path).is_none() {
        return Err(Rejection {
            code: "INVALID_FILE",
            message: "Only .xlsx, .xls and .csv files are supported".to_string(),
        });
    }

    let metadata = std::fs::metadata(path).map_err(|e| Rejection {
        code: "INVALID_FILE",
        message: format!("Cannot access '{}': {}", path.display(), e),
    })?;

    if metadata.len() > max_bytes {
        return Err(Rejection {
            code: "FILE_TOO_LARGE",
            message: format!(
                "File is {} bytes, the limit is {} bytes",
                metadata.len(),
                max_bytes
            ),
        });
    }

    Ok(())
}

fn error_code(e: &IngestError) -> &'static str {
    match e {
        IngestError::NotFound(_) => "NOT_FOUND",
        IngestError::UnreadableFile { .. } => "INVALID_FILE",
        _ => "INTERNAL_ERROR",
    }
}

async fn reply_json<T: Serialize>(client: &Client, reply: async_nats::Subject, body: &T) -> Result<()> {
    let _ = client.publish(reply, serde_json::to_vec(body)?.into()).await;
    Ok(())
}

/// Handle ingest.upload.submit messages
pub async fn handle_upload_submit(
    client: Client,
    mut subscriber: Subscriber,
    orchestrator: Arc<UploadOrchestrator>,
    max_upload_bytes: u64,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received upload.submit message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("upload.submit message without reply subject");
                continue;
            }
        };

        let request: Request<SubmitUploadRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse upload.submit request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                reply_json(&client, reply, &error).await?;
                continue;
            }
        };

        let payload = request.payload;
        let path = Path::new(&payload.file_path);

        if let Err(rejection) = validate_upload(path, max_upload_bytes) {
            warn!("Rejected upload '{}': {}", payload.file_name, rejection.message);
            let error = ErrorResponse::new(request.id, rejection.code, rejection.message);
            reply_json(&client, reply, &error).await?;
            continue;
        }

        match orchestrator.submit(payload.job_id, path, &payload.file_name).await {
            Ok(handle) => {
                let response = SubmitUploadResponse {
                    job_id: handle.job_id,
                    message: "Upload accepted, processing in background".to_string(),
                };
                reply_json(&client, reply, &SuccessResponse::new(request.id, response)).await?;
            }
            Err(e) => {
                error!("Failed to submit upload '{}': {}", payload.file_name, e);
                let error = ErrorResponse::new(request.id, "SUBMIT_ERROR", e.to_string());
                reply_json(&client, reply, &error).await?;
            }
        }
    }

    Ok(())
}

/// Handle ingest.upload.status messages
pub async fn handle_upload_status(
    client: Client,
    mut subscriber: Subscriber,
    orchestrator: Arc<UploadOrchestrator>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => continue,
        };

        let request: Request<UploadStatusRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse upload.status request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                reply_json(&client, reply, &error).await?;
                continue;
            }
        };

        match orchestrator.status(request.payload.job_id).await {
            Ok(job) => {
                let response = UploadStatusResponse::from(&job);
                reply_json(&client, reply, &SuccessResponse::new(request.id, response)).await?;
            }
            Err(e) => {
                if !matches!(e, IngestError::NotFound(_)) {
                    error!("Failed to load upload job {}: {}", request.payload.job_id, e);
                }
                let error = ErrorResponse::new(request.id, error_code(&e), e.to_string());
                reply_json(&client, reply, &error).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::write_temp_file;

    #[test]
    fn test_validate_rejects_unsupported_extension() {
        let path = write_temp_file("pdf", "%PDF");
        let rejection = validate_upload(&path, 1024).unwrap_err();
        assert_eq!(rejection.code, "INVALID_FILE");
    }

    #[test]
    fn test_validate_rejects_oversized_file() {
        let path = write_temp_file("csv", "agent,email\nA1,a@x.com\n");
        let rejection = validate_upload(&path, 4).unwrap_err();
        assert_eq!(rejection.code, "FILE_TOO_LARGE");
    }

    #[test]
    fn test_validate_rejects_missing_file() {
        let rejection = validate_upload(Path::new("/nope/gone.xlsx"), 1024).unwrap_err();
        assert_eq!(rejection.code, "INVALID_FILE");
    }

    #[test]
    fn test_validate_accepts_small_csv() {
        let path = write_temp_file("csv", "agent,email\nA1,a@x.com\n");
        assert_eq!(validate_upload(&path, 1024), Ok(()));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(error_code(&IngestError::NotFound(Uuid::nil())), "NOT_FOUND");
        assert_eq!(error_code(&IngestError::Persistence("x".into())), "INTERNAL_ERROR");
    }
}
