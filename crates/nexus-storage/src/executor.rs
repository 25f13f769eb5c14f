use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_linker::{CompactCandidate, LinkCandidate, LinkerError, QueryExecutor, SubtaskCandidate};
use nexus_types::TaskToolInvocation;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::Storage;

#[derive(sqlx::FromRow)]
struct CandidateRow {
    request_id: Uuid,
    conversation_id: Option<Uuid>,
    branch_id: String,
    timestamp: DateTime<Utc>,
    current_message_hash: Option<String>,
    system_hash: Option<String>,
    is_subtask: bool,
    parent_task_request_id: Option<Uuid>,
}

impl CandidateRow {
    fn into_candidate(self) -> Option<LinkCandidate> {
        Some(LinkCandidate {
            request_id: self.request_id,
            conversation_id: self.conversation_id?,
            branch_id: self.branch_id,
            timestamp: self.timestamp,
            current_message_hash: self.current_message_hash,
            system_hash: self.system_hash,
            is_subtask: self.is_subtask,
            parent_task_request_id: self.parent_task_request_id,
        })
    }
}

const CANDIDATE_COLUMNS: &str = "request_id, conversation_id, branch_id, timestamp, \
    current_message_hash, system_hash, is_subtask, parent_task_request_id";

#[async_trait]
impl QueryExecutor for Storage {
    async fn query_by_hash(
        &self,
        domain: &str,
        hash: &str,
        system_hash: Option<&str>,
    ) -> Result<Vec<LinkCandidate>, LinkerError> {
        query_by_hash(&self.pool, domain, hash, system_hash)
            .await
            .map_err(|e| LinkerError::Storage(e.to_string()))
    }

    async fn request_by_id(&self, id: Uuid) -> Result<Option<LinkCandidate>, LinkerError> {
        let row = sqlx::query_as::<_, CandidateRow>(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM api_requests WHERE request_id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LinkerError::Storage(e.to_string()))?;

        Ok(row.and_then(CandidateRow::into_candidate))
    }

    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<LinkCandidate>, LinkerError> {
        let rows = sqlx::query_as::<_, CandidateRow>(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM api_requests \
             WHERE parent_request_id = $1 ORDER BY timestamp ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LinkerError::Storage(e.to_string()))?;

        Ok(rows.into_iter().filter_map(CandidateRow::into_candidate).collect())
    }

    async fn subtask_candidates(
        &self,
        domain: &str,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<SubtaskCandidate>, LinkerError> {
        let window_start = window_end - chrono::Duration::seconds(60);

        #[derive(sqlx::FromRow)]
        struct Row {
            request_id: Uuid,
            timestamp: DateTime<Utc>,
            task_tool_invocation: Value,
        }

        let rows = sqlx::query_as::<_, Row>(
            "SELECT request_id, timestamp, task_tool_invocation FROM api_requests \
             WHERE domain = $1 AND timestamp BETWEEN $2 AND $3 \
             AND jsonb_array_length(task_tool_invocation) > 0 \
             ORDER BY timestamp DESC",
        )
        .bind(domain)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LinkerError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| SubtaskCandidate {
                request_id: r.request_id,
                timestamp: r.timestamp,
                invocations: serde_json::from_value::<Vec<TaskToolInvocation>>(r.task_tool_invocation)
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn compact_candidates(&self, domain: &str) -> Result<Vec<CompactCandidate>, LinkerError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            request_id: Uuid,
            conversation_id: Option<Uuid>,
            timestamp: DateTime<Utc>,
            response_body: Option<Value>,
        }

        let rows = sqlx::query_as::<_, Row>(
            "SELECT request_id, conversation_id, timestamp, response_body FROM api_requests \
             WHERE domain = $1 AND response_body IS NOT NULL AND conversation_id IS NOT NULL \
             ORDER BY timestamp DESC LIMIT 500",
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LinkerError::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let conversation_id = r.conversation_id?;
                let final_assistant_text = final_text(r.response_body.as_ref()?)?;
                Some(CompactCandidate {
                    request_id: r.request_id,
                    conversation_id,
                    timestamp: r.timestamp,
                    final_assistant_text,
                })
            })
            .collect())
    }
}

async fn query_by_hash(
    pool: &PgPool,
    domain: &str,
    hash: &str,
    system_hash: Option<&str>,
) -> sqlx::Result<Vec<LinkCandidate>> {
    let rows = match system_hash {
        Some(sys) => {
            sqlx::query_as::<_, CandidateRow>(&format!(
                "SELECT {CANDIDATE_COLUMNS} FROM api_requests \
                 WHERE domain = $1 AND current_message_hash = $2 AND system_hash = $3 \
                 AND conversation_id IS NOT NULL \
                 ORDER BY timestamp DESC"
            ))
            .bind(domain)
            .bind(hash)
            .bind(sys)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, CandidateRow>(&format!(
                "SELECT {CANDIDATE_COLUMNS} FROM api_requests \
                 WHERE domain = $1 AND current_message_hash = $2 \
                 AND conversation_id IS NOT NULL \
                 ORDER BY timestamp DESC"
            ))
            .bind(domain)
            .bind(hash)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows.into_iter().filter_map(CandidateRow::into_candidate).collect())
}

/// Concatenates the `text` blocks of a stored response body, the text a
/// "compact" continuation's summary is compared against.
fn final_text(response_body: &Value) -> Option<String> {
    let content = response_body.get("content")?.as_array()?;
    let text: String = content
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn final_text_joins_text_blocks_and_skips_tool_use() {
        let body = json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {}},
                {"type": "text", "text": "second"},
            ]
        });
        assert_eq!(final_text(&body).as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn final_text_is_none_for_tool_only_response() {
        let body = json!({
            "content": [{"type": "tool_use", "id": "t1", "name": "Bash", "input": {}}]
        });
        assert_eq!(final_text(&body), None);
    }
}
