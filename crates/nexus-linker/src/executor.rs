use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_types::TaskToolInvocation;
use uuid::Uuid;

use crate::LinkerError;

/// The subset of a stored `Request` the linker needs to make a decision.
/// `nexus-storage` maps its rows into this shape; the linker never touches
/// SQL directly (spec §9 "cyclic parent references... all graph traversals
/// go through C4 query executors").
#[derive(Debug, Clone)]
pub struct LinkCandidate {
    pub request_id: Uuid,
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub timestamp: DateTime<Utc>,
    pub current_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub is_subtask: bool,
    pub parent_task_request_id: Option<Uuid>,
}

/// A prior request carrying one or more `Task` tool invocations, scoped to
/// the sub-task detection window.
#[derive(Debug, Clone)]
pub struct SubtaskCandidate {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub invocations: Vec<TaskToolInvocation>,
}

/// A prior request whose final assistant response text is a candidate
/// match for a "compact" continuation's extracted summary.
#[derive(Debug, Clone)]
pub struct CompactCandidate {
    pub request_id: Uuid,
    pub conversation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub final_assistant_text: String,
}

/// Query surface the linker needs from storage. Implemented by
/// `nexus-storage` against Postgres; fakeable in-memory for unit tests.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Candidates whose `current_message_hash == hash`, scoped to `domain`,
    /// ordered by recency (most recent first). When `system_hash` is
    /// `Some`, only candidates with a matching `system_hash` are included
    /// (tier 1); when `None`, the system hash is ignored (tier 3).
    async fn query_by_hash(
        &self,
        domain: &str,
        hash: &str,
        system_hash: Option<&str>,
    ) -> Result<Vec<LinkCandidate>, LinkerError>;

    /// A single request by id, used to resolve `parent_task_request_id`
    /// inheritance chains.
    async fn request_by_id(&self, id: Uuid) -> Result<Option<LinkCandidate>, LinkerError>;

    /// All existing children of `parent_id` (requests whose
    /// `parent_request_id == parent_id`), ordered by timestamp ascending,
    /// used to decide whether a new child keeps the parent's branch or
    /// needs a fresh `branch_N`.
    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<LinkCandidate>, LinkerError>;

    /// Prior requests on `domain` carrying `Task` tool invocations whose
    /// timestamp falls in `[window_end - 60s, window_end]`.
    async fn subtask_candidates(
        &self,
        domain: &str,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<SubtaskCandidate>, LinkerError>;

    /// Prior requests on `domain` with a final assistant response, used to
    /// search for a "compact" continuation match.
    async fn compact_candidates(&self, domain: &str) -> Result<Vec<CompactCandidate>, LinkerError>;
}
