//! C4 — Storage Writer.
//!
//! Persists completed requests, their streaming chunks, and the analysis
//! queue to Postgres. Also implements [`nexus_linker::QueryExecutor`]
//! directly against the same tables, so the linker never touches SQL
//! itself (spec §4.3, §4.4, §9).

pub mod error;

mod analyses;
mod chunks;
mod executor;
mod requests;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use error::{StorageError, StorageResult};
pub use nexus_types::request::{ConversationAnalysis, Request, StreamingChunk};

/// Handle to the Postgres connection pool backing every storage
/// operation. Cheap to clone (an `Arc` internally) — shared across the
/// proxy's request handlers and the analysis worker.
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, true).await
    }

    /// Connect with control over whether migrations run — read-only
    /// tooling against an already-migrated database should pass `false`.
    pub async fn connect_with_options(database_url: &str, migrate: bool) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        if migrate {
            sqlx::migrate!("./migrations").run(&pool).await?;
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Persists a completed request and its streaming chunks (if any).
    /// Steps 3-5 of spec §4.4; the linker decision (steps 1-2) has
    /// already been folded into `req`'s linkage fields by the caller.
    pub async fn persist_request(
        &self,
        req: &Request,
        chunks: &[StreamingChunk],
    ) -> StorageResult<()> {
        requests::upsert(&self.pool, req).await?;
        chunks::insert_all(&self.pool, chunks).await?;
        Ok(())
    }

    pub async fn find_request(&self, id: uuid::Uuid) -> StorageResult<Option<Request>> {
        requests::find_by_id(&self.pool, id).await
    }

    pub async fn list_conversation_requests(
        &self,
        conversation_id: uuid::Uuid,
        branch_id: &str,
    ) -> StorageResult<Vec<Request>> {
        requests::list_conversation(&self.pool, conversation_id, branch_id).await
    }

    pub async fn list_chunks(&self, request_id: uuid::Uuid) -> StorageResult<Vec<StreamingChunk>> {
        chunks::list_for_request(&self.pool, request_id).await
    }

    pub async fn enqueue_analysis(
        &self,
        conversation_id: uuid::Uuid,
        branch_id: &str,
    ) -> StorageResult<uuid::Uuid> {
        analyses::enqueue(&self.pool, conversation_id, branch_id).await
    }

    /// Marks retry-exhausted `pending` analyses `failed`, then leases one
    /// `pending` row (spec §4.7 steps 1-2).
    pub async fn lease_next_analysis(&self, max_retries: i32) -> StorageResult<Option<ConversationAnalysis>> {
        analyses::fail_exhausted(&self.pool, max_retries).await?;
        analyses::lease_next(&self.pool, max_retries).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn complete_analysis(
        &self,
        id: uuid::Uuid,
        analysis_content: &str,
        analysis_data: &serde_json::Value,
        raw_response: &serde_json::Value,
        prompt_tokens: i32,
        completion_tokens: i32,
    ) -> StorageResult<()> {
        analyses::complete(
            &self.pool,
            id,
            analysis_content,
            analysis_data,
            raw_response,
            prompt_tokens,
            completion_tokens,
        )
        .await
    }

    pub async fn retry_analysis(&self, id: uuid::Uuid, error_message: &str) -> StorageResult<()> {
        analyses::retry(&self.pool, id, error_message).await
    }

    pub async fn revert_analysis_for_shutdown(&self, id: uuid::Uuid) -> StorageResult<()> {
        analyses::revert_for_shutdown(&self.pool, id).await
    }

    pub async fn mark_analysis_failed(
        &self,
        conversation_id: uuid::Uuid,
        branch_id: &str,
    ) -> StorageResult<()> {
        analyses::mark_failed(&self.pool, conversation_id, branch_id).await
    }

    pub async fn find_analysis(
        &self,
        conversation_id: uuid::Uuid,
        branch_id: &str,
    ) -> StorageResult<Option<ConversationAnalysis>> {
        analyses::find(&self.pool, conversation_id, branch_id).await
    }
}
