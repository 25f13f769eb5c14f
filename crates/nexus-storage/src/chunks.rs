use chrono::{DateTime, Utc};
use nexus_types::request::StreamingChunk;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StorageResult;

#[derive(sqlx::FromRow)]
struct ChunkRow {
    request_id: Uuid,
    chunk_index: i32,
    timestamp: DateTime<Utc>,
    data: String,
    token_count: Option<i32>,
}

impl From<ChunkRow> for StreamingChunk {
    fn from(row: ChunkRow) -> Self {
        StreamingChunk {
            request_id: row.request_id,
            chunk_index: row.chunk_index,
            timestamp: row.timestamp,
            data: row.data,
            token_count: row.token_count,
        }
    }
}

/// Inserts the raw SSE data lines captured for a streaming request. A
/// no-op for buffered requests, which never produce chunks.
pub async fn insert_all(pool: &PgPool, chunks: &[StreamingChunk]) -> StorageResult<()> {
    for chunk in chunks {
        sqlx::query(
            "INSERT INTO streaming_chunks (request_id, chunk_index, timestamp, data, token_count) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (request_id, chunk_index) DO NOTHING",
        )
        .bind(chunk.request_id)
        .bind(chunk.chunk_index)
        .bind(chunk.timestamp)
        .bind(&chunk.data)
        .bind(chunk.token_count)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn list_for_request(pool: &PgPool, request_id: Uuid) -> StorageResult<Vec<StreamingChunk>> {
    let rows = sqlx::query_as::<_, ChunkRow>(
        "SELECT request_id, chunk_index, timestamp, data, token_count \
         FROM streaming_chunks WHERE request_id = $1 ORDER BY chunk_index ASC",
    )
    .bind(request_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(StreamingChunk::from).collect())
}
