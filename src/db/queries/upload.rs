//! Upload job record queries

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::types::{JobFailure, RowError, UploadJob, UploadProgress, UploadResult, UploadStatus};

/// Statuses a record may still be written in
const OPEN_STATUSES: &str = "status IN ('pending', 'processing')";

#[derive(Debug, FromRow)]
struct UploadRow {
    job_id: Uuid,
    file_name: String,
    file_path: String,
    status: String,
    total_rows: i64,
    processed_rows: i64,
    percentage: i16,
    result: Option<Json<UploadResult>>,
    errors: Json<Vec<RowError>>,
    failure: Option<Json<JobFailure>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<UploadRow> for UploadJob {
    type Error = anyhow::Error;

    fn try_from(row: UploadRow) -> Result<Self> {
        let status = UploadStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("unknown upload status '{}'", row.status))?;

        Ok(UploadJob {
            job_id: row.job_id,
            file_name: row.file_name,
            file_path: row.file_path,
            status,
            progress: UploadProgress {
                total_rows: row.total_rows.max(0) as u64,
                processed_rows: row.processed_rows.max(0) as u64,
                percentage: row.percentage.clamp(0, 100) as u8,
            },
            result: row.result.map(|r| r.0),
            errors: row.errors.0,
            failure: row.failure.map(|f| f.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
        })
    }
}

/// Insert a new pending record
pub async fn insert_upload(pool: &PgPool, job: &UploadJob) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO uploads (job_id, file_name, file_path, status, total_rows, processed_rows,
            percentage, errors, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(job.job_id)
    .bind(&job.file_name)
    .bind(&job.file_path)
    .bind(job.status.as_str())
    .bind(job.progress.total_rows as i64)
    .bind(job.progress.processed_rows as i64)
    .bind(job.progress.percentage as i16)
    .bind(Json(&job.errors))
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Store progress on an open record. Returns false when nothing was updated.
pub async fn update_progress(pool: &PgPool, job_id: Uuid, progress: UploadProgress) -> Result<bool> {
    let query = format!(
        r#"
        UPDATE uploads
        SET status = 'processing', total_rows = $2, processed_rows = $3, percentage = $4,
            updated_at = NOW()
        WHERE job_id = $1 AND {OPEN_STATUSES}
        "#
    );

    let result = sqlx::query(&query)
        .bind(job_id)
        .bind(progress.total_rows as i64)
        .bind(progress.processed_rows as i64)
        .bind(progress.percentage as i16)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Mark an open record completed. Returns false when nothing was updated.
pub async fn complete_upload(
    pool: &PgPool,
    job_id: Uuid,
    result: &UploadResult,
    errors: &[RowError],
) -> Result<bool> {
    let query = format!(
        r#"
        UPDATE uploads
        SET status = 'completed', result = $2, errors = $3,
            completed_at = NOW(), updated_at = NOW()
        WHERE job_id = $1 AND {OPEN_STATUSES}
        "#
    );

    let updated = sqlx::query(&query)
        .bind(job_id)
        .bind(Json(result))
        .bind(Json(errors))
        .execute(pool)
        .await?;

    Ok(updated.rows_affected() > 0)
}

/// Mark an open record failed. Returns false when nothing was updated.
pub async fn fail_upload(
    pool: &PgPool,
    job_id: Uuid,
    failure: &JobFailure,
    errors: &[RowError],
) -> Result<bool> {
    let query = format!(
        r#"
        UPDATE uploads
        SET status = 'failed', failure = $2, errors = $3,
            failed_at = NOW(), updated_at = NOW()
        WHERE job_id = $1 AND {OPEN_STATUSES}
        "#
    );

    let updated = sqlx::query(&query)
        .bind(job_id)
        .bind(Json(failure))
        .bind(Json(errors))
        .execute(pool)
        .await?;

    Ok(updated.rows_affected() > 0)
}

pub async fn get_upload(pool: &PgPool, job_id: Uuid) -> Result<Option<UploadJob>> {
    let row: Option<UploadRow> = sqlx::query_as(
        r#"
        SELECT job_id, file_name, file_path, status, total_rows, processed_rows, percentage,
            result, errors, failure, created_at, updated_at, completed_at, failed_at
        FROM uploads
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(UploadJob::try_from).transpose()
}
