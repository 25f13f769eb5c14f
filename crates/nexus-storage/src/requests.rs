use chrono::{DateTime, Utc};
use nexus_types::request::{Request, RequestType, TaskToolInvocation, Usage};
use sqlx::PgPool;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StorageResult;

#[derive(sqlx::FromRow)]
pub(crate) struct RequestRow {
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
    pub request_type: String,
    pub message_count: i32,
    pub current_message_hash: Option<String>,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub branch_id: String,
    pub parent_request_id: Option<Uuid>,
    pub parent_task_request_id: Option<Uuid>,
    pub is_subtask: bool,
    pub task_tool_invocation: serde_json::Value,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub first_token_ms: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub account_id: Option<String>,
    pub api_key_hash: Option<String>,
}

impl RequestRow {
    pub(crate) fn into_request(self) -> Request {
        let task_tool_invocation: Vec<TaskToolInvocation> =
            serde_json::from_value(self.task_tool_invocation).unwrap_or_default();

        Request {
            request_id: self.request_id,
            domain: self.domain,
            timestamp: self.timestamp,
            method: self.method,
            path: self.path,
            headers: self.headers,
            body: self.body,
            response_body: self.response_body,
            response_streaming: self.response_streaming,
            model: self.model,
            request_type: RequestType::from_str(&self.request_type).unwrap_or(RequestType::Other),
            message_count: self.message_count,
            current_message_hash: self.current_message_hash,
            parent_message_hash: self.parent_message_hash,
            system_hash: self.system_hash,
            conversation_id: self.conversation_id,
            branch_id: self.branch_id,
            parent_request_id: self.parent_request_id,
            parent_task_request_id: self.parent_task_request_id,
            is_subtask: self.is_subtask,
            usage: Usage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                cache_creation_input_tokens: self.cache_creation_input_tokens,
                cache_read_input_tokens: self.cache_read_input_tokens,
            },
            first_token_ms: self.first_token_ms,
            duration_ms: self.duration_ms,
            error: self.error,
            task_tool_invocation,
            account_id: self.account_id,
            api_key_hash: self.api_key_hash,
        }
    }
}

const REQUEST_COLUMNS: &str = "request_id, domain, timestamp, method, path, headers, body, \
    response_body, response_streaming, model, request_type, message_count, \
    current_message_hash, parent_message_hash, system_hash, conversation_id, branch_id, \
    parent_request_id, parent_task_request_id, is_subtask, task_tool_invocation, \
    input_tokens, output_tokens, cache_creation_input_tokens, cache_read_input_tokens, \
    first_token_ms, duration_ms, error, account_id, api_key_hash";

/// Inserts a completed `Request`, along with its usage/token aggregate
/// (`total_tokens`) and tool-call count. Idempotent on `request_id`: a
/// repeat delivery (e.g. a retried proxy write after a transient DB
/// outage) is silently skipped rather than erroring (spec §4.4).
pub async fn upsert(pool: &PgPool, req: &Request) -> StorageResult<()> {
    let total_tokens = req.usage.total();
    let tool_call_count = req.tool_call_count() as i32;
    let task_tool_invocation = serde_json::to_value(&req.task_tool_invocation).unwrap_or_default();

    sqlx::query(&format!(
        "INSERT INTO api_requests ({REQUEST_COLUMNS}, total_tokens, tool_call_count, usage_data) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
         $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32) \
         ON CONFLICT (request_id) DO NOTHING"
    ))
    .bind(req.request_id)
    .bind(&req.domain)
    .bind(req.timestamp)
    .bind(&req.method)
    .bind(&req.path)
    .bind(&req.headers)
    .bind(&req.body)
    .bind(&req.response_body)
    .bind(req.response_streaming)
    .bind(&req.model)
    .bind(req.request_type.as_str())
    .bind(req.message_count)
    .bind(&req.current_message_hash)
    .bind(&req.parent_message_hash)
    .bind(&req.system_hash)
    .bind(req.conversation_id)
    .bind(&req.branch_id)
    .bind(req.parent_request_id)
    .bind(req.parent_task_request_id)
    .bind(req.is_subtask)
    .bind(&task_tool_invocation)
    .bind(req.usage.input_tokens)
    .bind(req.usage.output_tokens)
    .bind(req.usage.cache_creation_input_tokens)
    .bind(req.usage.cache_read_input_tokens)
    .bind(req.first_token_ms)
    .bind(req.duration_ms)
    .bind(&req.error)
    .bind(&req.account_id)
    .bind(&req.api_key_hash)
    .bind(total_tokens)
    .bind(tool_call_count)
    .bind(serde_json::json!({
        "input_tokens": req.usage.input_tokens,
        "output_tokens": req.usage.output_tokens,
        "cache_creation_input_tokens": req.usage.cache_creation_input_tokens,
        "cache_read_input_tokens": req.usage.cache_read_input_tokens,
    }))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> StorageResult<Option<Request>> {
    let row = sqlx::query_as::<_, RequestRow>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM api_requests WHERE request_id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(RequestRow::into_request))
}

/// All requests belonging to a conversation branch, oldest first — the
/// transcript the analysis worker assembles a summary from.
pub async fn list_conversation(
    pool: &PgPool,
    conversation_id: Uuid,
    branch_id: &str,
) -> StorageResult<Vec<Request>> {
    let rows = sqlx::query_as::<_, RequestRow>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM api_requests \
         WHERE conversation_id = $1 AND branch_id = $2 \
         ORDER BY timestamp ASC"
    ))
    .bind(conversation_id)
    .bind(branch_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(RequestRow::into_request).collect())
}
