use chrono::{DateTime, Utc};
use nexus_types::request::{AnalysisStatus, ConversationAnalysis};
use sqlx::PgPool;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StorageResult;

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    id: Uuid,
    conversation_id: Uuid,
    branch_id: String,
    status: String,
    retry_count: i32,
    error_message: Option<String>,
    analysis_content: Option<String>,
    analysis_data: Option<serde_json::Value>,
    raw_response: Option<serde_json::Value>,
    prompt_tokens: Option<i32>,
    completion_tokens: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<AnalysisRow> for ConversationAnalysis {
    fn from(row: AnalysisRow) -> Self {
        ConversationAnalysis {
            id: row.id,
            conversation_id: row.conversation_id,
            branch_id: row.branch_id,
            status: AnalysisStatus::from_str(&row.status).unwrap_or(AnalysisStatus::Failed),
            retry_count: row.retry_count,
            error_message: row.error_message,
            analysis_content: row.analysis_content,
            analysis_data: row.analysis_data,
            raw_response: row.raw_response,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

const ANALYSIS_COLUMNS: &str = "id, conversation_id, branch_id, status, retry_count, \
    error_message, analysis_content, analysis_data, raw_response, prompt_tokens, \
    completion_tokens, created_at, updated_at, completed_at";

/// Creates (or reuses) the `pending` row for a conversation branch. A
/// dashboard-triggered regenerate (SPEC_FULL §2) inserts a fresh row even
/// when a `completed`/`failed` one already exists, since the partial
/// unique index only forbids a second *non-failed* row — a `completed`
/// row still collides, so callers needing to force a rerun should mark
/// the prior row `failed` first via [`mark_failed`].
pub async fn enqueue(pool: &PgPool, conversation_id: Uuid, branch_id: &str) -> StorageResult<Uuid> {
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO conversation_analyses (conversation_id, branch_id, status) \
         VALUES ($1, $2, 'pending') \
         ON CONFLICT (conversation_id, branch_id) WHERE status <> 'failed' \
         DO UPDATE SET conversation_id = excluded.conversation_id \
         RETURNING id",
    )
    .bind(conversation_id)
    .bind(branch_id)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// The at-most-once lease (spec §4.7, §5): in one transaction, claims a
/// single `pending` row with `retry_count < max_retries` via `FOR UPDATE
/// SKIP LOCKED`, flips it to `processing`, and returns it. Concurrent
/// callers never observe the same row — `SKIP LOCKED` makes a row
/// invisible to every other leaser for the lifetime of this transaction.
pub async fn lease_next(pool: &PgPool, max_retries: i32) -> StorageResult<Option<ConversationAnalysis>> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, AnalysisRow>(&format!(
        "SELECT {ANALYSIS_COLUMNS} FROM conversation_analyses \
         WHERE status = 'pending' AND retry_count < $1 \
         ORDER BY created_at ASC \
         FOR UPDATE SKIP LOCKED \
         LIMIT 1"
    ))
    .bind(max_retries)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(None);
    };

    sqlx::query(
        "UPDATE conversation_analyses SET status = 'processing', updated_at = now() WHERE id = $1",
    )
    .bind(row.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(ConversationAnalysis::from(row)))
}

/// Marks every `pending` row that has exhausted its retry budget as
/// `failed` (spec §4.7 step 2), called once per poll before leasing.
pub async fn fail_exhausted(pool: &PgPool, max_retries: i32) -> StorageResult<u64> {
    let result = sqlx::query(
        "UPDATE conversation_analyses \
         SET status = 'failed', error_message = 'max retries exceeded', updated_at = now() \
         WHERE status = 'pending' AND retry_count >= $1",
    )
    .bind(max_retries)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn complete(
    pool: &PgPool,
    id: Uuid,
    analysis_content: &str,
    analysis_data: &serde_json::Value,
    raw_response: &serde_json::Value,
    prompt_tokens: i32,
    completion_tokens: i32,
) -> StorageResult<()> {
    sqlx::query(
        "UPDATE conversation_analyses SET \
         status = 'completed', analysis_content = $2, analysis_data = $3, raw_response = $4, \
         prompt_tokens = $5, completion_tokens = $6, completed_at = now(), updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(analysis_content)
    .bind(analysis_data)
    .bind(raw_response)
    .bind(prompt_tokens)
    .bind(completion_tokens)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reverts a job to `pending` and records the failure, incrementing
/// `retry_count` (spec §4.7 step 7).
pub async fn retry(pool: &PgPool, id: Uuid, error_message: &str) -> StorageResult<()> {
    sqlx::query(
        "UPDATE conversation_analyses SET \
         status = 'pending', retry_count = retry_count + 1, error_message = $2, updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reverts a job to `pending` WITHOUT incrementing `retry_count` — used
/// only for a worker-shutdown cancellation, which is not a job failure
/// (spec §4.7 "jobs revert to pending without incrementing retries").
pub async fn revert_for_shutdown(pool: &PgPool, id: Uuid) -> StorageResult<()> {
    sqlx::query(
        "UPDATE conversation_analyses SET status = 'pending', updated_at = now() WHERE id = $1 \
         AND status = 'processing'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &PgPool, conversation_id: Uuid, branch_id: &str) -> StorageResult<()> {
    sqlx::query(
        "UPDATE conversation_analyses SET status = 'failed', updated_at = now() \
         WHERE conversation_id = $1 AND branch_id = $2 AND status <> 'failed'",
    )
    .bind(conversation_id)
    .bind(branch_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find(pool: &PgPool, conversation_id: Uuid, branch_id: &str) -> StorageResult<Option<ConversationAnalysis>> {
    let row = sqlx::query_as::<_, AnalysisRow>(&format!(
        "SELECT {ANALYSIS_COLUMNS} FROM conversation_analyses \
         WHERE conversation_id = $1 AND branch_id = $2 AND status <> 'failed' \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(conversation_id)
    .bind(branch_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(ConversationAnalysis::from))
}
