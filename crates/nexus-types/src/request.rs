use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the proxy classified an inbound call; only `Inference` requests
/// participate in conversation linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Inference,
    QueryEvaluation,
    Quota,
    Other,
}

impl RequestType {
    /// Only inference requests are linked into conversations; everything
    /// else still gets hashed and stored, but with `conversation_id = NULL`.
    pub fn participates_in_linking(self) -> bool {
        matches!(self, RequestType::Inference)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Inference => "inference",
            RequestType::QueryEvaluation => "query_evaluation",
            RequestType::Quota => "quota",
            RequestType::Other => "other",
        }
    }
}

impl std::str::FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inference" => Ok(RequestType::Inference),
            "query_evaluation" => Ok(RequestType::QueryEvaluation),
            "quota" => Ok(RequestType::Quota),
            "other" => Ok(RequestType::Other),
            other => Err(format!("unknown request type: {other}")),
        }
    }
}

/// Token usage as reported by the upstream API, assembled either from a
/// buffered JSON body or reassembled SSE deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

impl Usage {
    pub fn total(&self) -> i64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// A `Task` tool invocation recorded on a response, used by the linker to
/// detect sub-task spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskToolInvocation {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl TaskToolInvocation {
    /// Extracts `input.prompt` or `input.description`, whichever is present;
    /// the linker compares this text against a new conversation's first
    /// user message.
    pub fn prompt_text(&self) -> Option<&str> {
        self.input
            .get("prompt")
            .and_then(|v| v.as_str())
            .or_else(|| self.input.get("description").and_then(|v| v.as_str()))
    }
}

/// One row per client HTTP call that reaches the proxy. Mirrors
/// `api_requests` (spec §6); created once on proxy entry, mutated once after
/// upstream completion, never updated thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: Uuid,
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub headers: serde_json::Value,

    pub body: serde_json::Value,
    pub response_body: Option<serde_json::Value>,
    pub response_streaming: bool,

    pub model: Option<String>,
    pub request_type: RequestType,
    pub message_count: i32,

    pub current_message_hash: Option<String>,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,

    pub conversation_id: Option<Uuid>,
    pub branch_id: String,
    pub parent_request_id: Option<Uuid>,
    pub parent_task_request_id: Option<Uuid>,
    pub is_subtask: bool,

    pub usage: Usage,
    pub first_token_ms: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub task_tool_invocation: Vec<TaskToolInvocation>,

    pub account_id: Option<String>,
    pub api_key_hash: Option<String>,
}

impl Request {
    /// Branch id assigned to the first request of a brand new conversation.
    pub const ROOT_BRANCH: &'static str = "main";

    pub fn tool_call_count(&self) -> usize {
        self.task_tool_invocation.len()
    }
}

/// Ordered fragment of an SSE response. Keyed by `(request_id, chunk_index)`;
/// cascades on `Request` delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingChunk {
    pub request_id: Uuid,
    pub chunk_index: i32,
    pub timestamp: DateTime<Utc>,
    pub data: String,
    pub token_count: Option<i32>,
}

/// Lifecycle state of a `ConversationAnalysis` row. Stored as lowercase text
/// (`pending | processing | completed | failed`) rather than a native
/// Postgres enum, so adding a state never requires an `ALTER TYPE` migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "processing" => Ok(AnalysisStatus::Processing),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            other => Err(format!("unknown analysis status: {other}")),
        }
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per `(conversation_id, branch_id)` active at a time (spec §3); at
/// most one non-`failed` row may exist for a given pair, enforced by a
/// partial unique index in storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationAnalysis {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub status: AnalysisStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub analysis_content: Option<String>,
    pub analysis_data: Option<serde_json::Value>,
    pub raw_response: Option<serde_json::Value>,
    pub prompt_tokens: Option<i32>,
    pub completion_tokens: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
