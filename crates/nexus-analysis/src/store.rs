use async_trait::async_trait;
use nexus_types::request::{ConversationAnalysis, Request};
use uuid::Uuid;

use crate::error::{AnalysisError, AnalysisResult};

/// Storage operations the worker needs, kept behind a trait so the poll
/// loop is unit-testable against an in-memory fake rather than a live
/// Postgres instance — the same split `nexus-linker` draws around
/// `QueryExecutor`.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn lease_next(&self, max_retries: i32) -> AnalysisResult<Option<ConversationAnalysis>>;

    async fn list_conversation_requests(
        &self,
        conversation_id: Uuid,
        branch_id: &str,
    ) -> AnalysisResult<Vec<Request>>;

    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        id: Uuid,
        analysis_content: &str,
        analysis_data: &serde_json::Value,
        raw_response: &serde_json::Value,
        prompt_tokens: i32,
        completion_tokens: i32,
    ) -> AnalysisResult<()>;

    async fn retry(&self, id: Uuid, error_message: &str) -> AnalysisResult<()>;

    async fn revert_for_shutdown(&self, id: Uuid) -> AnalysisResult<()>;
}

#[async_trait]
impl AnalysisStore for nexus_storage::Storage {
    async fn lease_next(&self, max_retries: i32) -> AnalysisResult<Option<ConversationAnalysis>> {
        self.lease_next_analysis(max_retries)
            .await
            .map_err(|e| AnalysisError::Storage(e.to_string()))
    }

    async fn list_conversation_requests(
        &self,
        conversation_id: Uuid,
        branch_id: &str,
    ) -> AnalysisResult<Vec<Request>> {
        self.list_conversation_requests(conversation_id, branch_id)
            .await
            .map_err(|e| AnalysisError::Storage(e.to_string()))
    }

    async fn complete(
        &self,
        id: Uuid,
        analysis_content: &str,
        analysis_data: &serde_json::Value,
        raw_response: &serde_json::Value,
        prompt_tokens: i32,
        completion_tokens: i32,
    ) -> AnalysisResult<()> {
        self.complete_analysis(
            id,
            analysis_content,
            analysis_data,
            raw_response,
            prompt_tokens,
            completion_tokens,
        )
        .await
        .map_err(|e| AnalysisError::Storage(e.to_string()))
    }

    async fn retry(&self, id: Uuid, error_message: &str) -> AnalysisResult<()> {
        self.retry_analysis(id, error_message)
            .await
            .map_err(|e| AnalysisError::Storage(e.to_string()))
    }

    async fn revert_for_shutdown(&self, id: Uuid) -> AnalysisResult<()> {
        self.revert_analysis_for_shutdown(id)
            .await
            .map_err(|e| AnalysisError::Storage(e.to_string()))
    }
}
