//! C6 — Response Capture.
//!
//! Reassembles the final message, token usage and timing out of an
//! upstream response without slowing down what the client receives.
//! Streaming responses are forwarded to the client byte-for-byte through a
//! [`ShadowStream`] tee while a background task reassembles the SSE
//! sequence for storage; non-streaming responses are parsed directly out
//! of the buffered JSON body.

mod shadow;
mod sse;

use std::time::{Duration, Instant};

use bytes::Bytes;
use nexus_types::request::{TaskToolInvocation, Usage};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

pub use shadow::ShadowStream;
pub use sse::{accumulate_sse, Captured, SseAccumulator};

/// Everything the proxy persists about an upstream response, whichever
/// path (streaming or buffered) produced it.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub response_body: Value,
    pub model: Option<String>,
    pub usage: Usage,
    pub stop_reason: Option<String>,
    pub task_invocations: Vec<TaskToolInvocation>,
    pub error: Option<String>,
    pub first_token_ms: Option<i64>,
    pub duration_ms: i64,
    /// Raw `data:` lines in arrival order, for the `streaming_chunks` table.
    /// Empty for a buffered (non-streaming) response.
    pub raw_chunks: Vec<String>,
}

/// Drains a tee channel fed by a [`ShadowStream`], timestamping the first
/// chunk's arrival and reassembling the SSE sequence once the upstream
/// response closes. Runs as its own background task so the client's byte
/// stream is never held up waiting on this work (spec §4.6, §5).
pub async fn capture_stream(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    started_at: Instant,
) -> CaptureResult {
    let mut buffer = String::new();
    let mut raw_chunks = Vec::new();
    let mut first_token_at: Option<Instant> = None;
    let mut leftover = String::new();

    while let Some(chunk) = rx.recv().await {
        if first_token_at.is_none() {
            first_token_at = Some(Instant::now());
        }

        let text = String::from_utf8_lossy(&chunk);
        leftover.push_str(&text);

        while let Some(pos) = leftover.find("\n\n") {
            let event_block = leftover[..pos].to_string();
            leftover = leftover[pos + 2..].to_string();

            for line in event_block.lines() {
                if let Some(data) = line.trim().strip_prefix("data: ") {
                    raw_chunks.push(data.to_string());
                }
            }
            buffer.push_str(&event_block);
            buffer.push_str("\n\n");
        }
    }
    buffer.push_str(&leftover);

    let captured = accumulate_sse(&buffer);
    if let Some(reason) = &captured.error {
        warn!(reason, "upstream stream ended abnormally");
    }
    let duration = started_at.elapsed();

    CaptureResult {
        response_body: captured.response_body,
        model: captured.model,
        usage: captured.usage,
        stop_reason: captured.stop_reason,
        task_invocations: captured.task_invocations,
        error: captured.error,
        first_token_ms: first_token_at.map(|t| (t - started_at).as_millis() as i64),
        duration_ms: duration.as_millis() as i64,
        raw_chunks,
    }
}

/// Extracts the same facts directly from a buffered (non-streaming)
/// response body, for `"stream": false` requests.
pub fn capture_buffered(body: &Value, started_at: Instant) -> CaptureResult {
    let model = body.get("model").and_then(Value::as_str).map(str::to_string);
    let stop_reason = body.get("stop_reason").and_then(Value::as_str).map(str::to_string);
    let usage = body
        .get("usage")
        .map(|u| Usage {
            input_tokens: u.get("input_tokens").and_then(Value::as_i64).unwrap_or(0),
            output_tokens: u.get("output_tokens").and_then(Value::as_i64).unwrap_or(0),
            cache_creation_input_tokens: u
                .get("cache_creation_input_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            cache_read_input_tokens: u
                .get("cache_read_input_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        })
        .unwrap_or_default();

    let task_invocations = body
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("tool_use"))
                .filter(|item| item.get("name").and_then(Value::as_str) == Some("Task"))
                .map(|item| TaskToolInvocation {
                    id: item.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    name: "Task".to_string(),
                    input: item.get("input").cloned().unwrap_or(Value::Null),
                })
                .collect()
        })
        .unwrap_or_default();

    CaptureResult {
        response_body: body.clone(),
        model,
        usage,
        stop_reason,
        task_invocations,
        error: None,
        first_token_ms: None,
        duration_ms: started_at.elapsed().as_millis() as i64,
        raw_chunks: Vec::new(),
    }
}

/// A guard future's worth of bookkeeping: once a caller knows it is about
/// to issue the upstream call, this records "now" so later timing fields
/// are relative to the same origin whichever capture path is taken.
pub fn now() -> Instant {
    Instant::now()
}

pub fn since(started_at: Instant) -> Duration {
    started_at.elapsed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn capture_stream_reassembles_chunks_split_across_frames() {
        let (tx, rx) = mpsc::unbounded_channel();
        let started = Instant::now();

        let parts = [
            "event: message_start\ndata: {\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-7-sonnet\",\"usage\":{\"input_tokens\":3}}}\n\n",
            "event: content_block_start\ndata: {\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\nevent: content_block_delta\ndata: ",
            "{\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\nevent: content_block_stop\ndata: {\"index\":0}\n\n",
            "event: message_delta\ndata: {\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":1}}\n\nevent: message_stop\ndata: {}\n\n",
        ];
        for part in parts {
            tx.send(Bytes::from_static(part.as_bytes())).unwrap();
        }
        drop(tx);

        let result = capture_stream(rx, started).await;
        assert_eq!(result.error, None);
        assert_eq!(result.response_body["content"][0]["text"], json!("hi"));
        assert_eq!(result.usage.input_tokens, 3);
        assert_eq!(result.usage.output_tokens, 1);
        assert!(result.first_token_ms.is_some());
        assert!(!result.raw_chunks.is_empty());
    }

    #[test]
    fn capture_buffered_extracts_usage_and_tool_calls() {
        let started = Instant::now();
        let body = json!({
            "model": "claude-3-7-sonnet",
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 4},
            "content": [
                {"type": "tool_use", "id": "toolu_9", "name": "Task", "input": {"description": "spawn worker"}}
            ]
        });

        let result = capture_buffered(&body, started);
        assert_eq!(result.model.as_deref(), Some("claude-3-7-sonnet"));
        assert_eq!(result.usage.output_tokens, 4);
        assert_eq!(result.task_invocations.len(), 1);
        assert_eq!(result.first_token_ms, None);
    }
}
