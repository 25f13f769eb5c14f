use nexus_types::request::{TaskToolInvocation, Usage};
use serde_json::{json, Value};

/// A single content block under construction as its `content_block_start`
/// / `_delta` / `_stop` triad arrives.
enum BlockState {
    Text(String),
    Thinking(String),
    ToolUse { id: String, name: String, partial_json: String },
}

/// Incrementally parses an Anthropic SSE response into a final message plus
/// the side-channel facts the proxy needs (usage, stop reason, `Task` tool
/// invocations). Fed one `event:`/`data:` line pair at a time; the caller
/// owns splitting the raw byte stream into lines (spec §4.6).
#[derive(Default)]
pub struct SseAccumulator {
    model: Option<String>,
    message_id: Option<String>,
    usage: Usage,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
    blocks: Vec<Option<BlockState>>,
    finished_blocks: Vec<Value>,
    task_invocations: Vec<TaskToolInvocation>,
    saw_message_stop: bool,
    error: Option<String>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one SSE line (already stripped of the `event: ` / `data: `
    /// prefix keyword). `event_type` is the most recently seen `event:`
    /// line; `data` is the JSON payload of a `data:` line.
    pub fn ingest(&mut self, event_type: &str, data: &str) {
        if data == "[DONE]" {
            return;
        }
        let parsed: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return,
        };

        match event_type {
            "message_start" => self.on_message_start(&parsed),
            "content_block_start" => self.on_content_block_start(&parsed),
            "content_block_delta" => self.on_content_block_delta(&parsed),
            "content_block_stop" => self.on_content_block_stop(&parsed),
            "message_delta" => self.on_message_delta(&parsed),
            "message_stop" => self.saw_message_stop = true,
            "error" => {
                self.error = Some(
                    parsed
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or(data)
                        .to_string(),
                );
            }
            _ => {}
        }
    }

    fn on_message_start(&mut self, data: &Value) {
        let Some(message) = data.get("message") else { return };
        self.message_id = message.get("id").and_then(Value::as_str).map(str::to_string);
        self.model = message.get("model").and_then(Value::as_str).map(str::to_string);
        if let Some(usage) = message.get("usage") {
            self.usage = usage_from_json(usage, self.usage);
        }
    }

    fn on_content_block_start(&mut self, data: &Value) {
        let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        let Some(block) = data.get("content_block") else { return };
        let state = match block.get("type").and_then(Value::as_str) {
            Some("tool_use") => BlockState::ToolUse {
                id: block.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                partial_json: String::new(),
            },
            Some("thinking") => BlockState::Thinking(String::new()),
            _ => BlockState::Text(String::new()),
        };
        self.set_block(index, state);
    }

    fn on_content_block_delta(&mut self, data: &Value) {
        let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        let Some(delta) = data.get("delta") else { return };
        let Some(Some(state)) = self.blocks.get_mut(index) else { return };
        match delta.get("type").and_then(Value::as_str) {
            Some("text_delta") => {
                if let (BlockState::Text(buf), Some(text)) =
                    (state, delta.get("text").and_then(Value::as_str))
                {
                    buf.push_str(text);
                }
            }
            Some("thinking_delta") => {
                if let (BlockState::Thinking(buf), Some(text)) =
                    (state, delta.get("thinking").and_then(Value::as_str))
                {
                    buf.push_str(text);
                }
            }
            Some("input_json_delta") => {
                if let (BlockState::ToolUse { partial_json, .. }, Some(partial)) =
                    (state, delta.get("partial_json").and_then(Value::as_str))
                {
                    partial_json.push_str(partial);
                }
            }
            _ => {}
        }
    }

    fn on_content_block_stop(&mut self, data: &Value) {
        let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        let Some(slot) = self.blocks.get_mut(index) else { return };
        let Some(state) = slot.take() else { return };

        match state {
            BlockState::Text(text) => {
                self.finished_blocks.push(json!({ "type": "text", "text": text }));
            }
            BlockState::Thinking(text) => {
                self.finished_blocks.push(json!({ "type": "thinking", "thinking": text }));
            }
            BlockState::ToolUse { id, name, partial_json } => {
                let input: Value = serde_json::from_str(&partial_json).unwrap_or(json!({}));
                if name == "Task" {
                    self.task_invocations.push(TaskToolInvocation {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                self.finished_blocks.push(json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                }));
            }
        }
    }

    fn on_message_delta(&mut self, data: &Value) {
        if let Some(delta) = data.get("delta") {
            self.stop_reason = delta.get("stop_reason").and_then(Value::as_str).map(str::to_string);
            self.stop_sequence = delta.get("stop_sequence").and_then(Value::as_str).map(str::to_string);
        }
        if let Some(usage) = data.get("usage") {
            self.usage = usage_from_json(usage, self.usage);
        }
    }

    fn set_block(&mut self, index: usize, state: BlockState) {
        if self.blocks.len() <= index {
            self.blocks.resize_with(index + 1, || None);
        }
        self.blocks[index] = Some(state);
    }

    /// Finalizes the accumulation. A stream that never reached
    /// `message_stop` is truncated (spec §4.6 "tolerates a stream cut off
    /// mid-response") — the caller still gets whatever content was
    /// assembled, tagged with `error = "stream_truncated"`.
    pub fn finish(mut self) -> Captured {
        if !self.saw_message_stop && self.error.is_none() {
            self.error = Some("stream_truncated".to_string());
        }

        let body = json!({
            "id": self.message_id,
            "type": "message",
            "role": "assistant",
            "model": self.model,
            "content": self.finished_blocks,
            "stop_reason": self.stop_reason,
            "stop_sequence": self.stop_sequence,
            "usage": {
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
                "cache_creation_input_tokens": self.usage.cache_creation_input_tokens,
                "cache_read_input_tokens": self.usage.cache_read_input_tokens,
            },
        });

        Captured {
            response_body: body,
            model: self.model_or_none(),
            usage: self.usage,
            stop_reason: self.stop_reason,
            task_invocations: self.task_invocations,
            error: self.error,
        }
    }

    fn model_or_none(&self) -> Option<String> {
        self.model.clone()
    }
}

fn usage_from_json(usage: &Value, prior: Usage) -> Usage {
    Usage {
        input_tokens: usage
            .get("input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(prior.input_tokens),
        output_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(prior.output_tokens),
        cache_creation_input_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(prior.cache_creation_input_tokens),
        cache_read_input_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(prior.cache_read_input_tokens),
    }
}

/// Result of draining an `SseAccumulator`.
pub struct Captured {
    pub response_body: Value,
    pub model: Option<String>,
    pub usage: Usage,
    pub stop_reason: Option<String>,
    pub task_invocations: Vec<TaskToolInvocation>,
    pub error: Option<String>,
}

/// Splits a buffer of concatenated SSE text into `(event, data)` pairs and
/// feeds each into a fresh accumulator. `event:` lines set the event type
/// for the `data:` line(s) that follow, matching Anthropic's one-event-per
/// block framing.
pub fn accumulate_sse(buffer: &str) -> Captured {
    let mut acc = SseAccumulator::new();
    let mut current_event = String::new();

    for line in buffer.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(event) = line.strip_prefix("event: ") {
            current_event = event.to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            acc.ingest(&current_event, data);
        }
    }

    acc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(events: &[(&str, Value)]) -> String {
        events
            .iter()
            .map(|(ev, data)| format!("event: {ev}\ndata: {data}\n\n"))
            .collect()
    }

    #[test]
    fn reassembles_text_and_usage_from_a_full_stream() {
        let buffer = sse(&[
            (
                "message_start",
                json!({"message": {"id": "msg_1", "model": "claude-3-7-sonnet", "usage": {"input_tokens": 10, "output_tokens": 0}}}),
            ),
            ("content_block_start", json!({"index": 0, "content_block": {"type": "text", "text": ""}})),
            ("content_block_delta", json!({"index": 0, "delta": {"type": "text_delta", "text": "Hello"}})),
            ("content_block_delta", json!({"index": 0, "delta": {"type": "text_delta", "text": " world"}})),
            ("content_block_stop", json!({"index": 0})),
            ("message_delta", json!({"delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}})),
            ("message_stop", json!({})),
        ]);

        let captured = accumulate_sse(&buffer);
        assert_eq!(captured.error, None);
        assert_eq!(captured.model.as_deref(), Some("claude-3-7-sonnet"));
        assert_eq!(captured.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(captured.usage.input_tokens, 10);
        assert_eq!(captured.usage.output_tokens, 2);
        assert_eq!(
            captured.response_body["content"][0]["text"],
            json!("Hello world")
        );
    }

    #[test]
    fn captures_task_tool_invocation() {
        let buffer = sse(&[
            ("message_start", json!({"message": {"id": "msg_2", "model": "claude-3-7-sonnet", "usage": {"input_tokens": 5}}})),
            (
                "content_block_start",
                json!({"index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "Task"}}),
            ),
            (
                "content_block_delta",
                json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"prompt\": \"do a thing\"}"}}),
            ),
            ("content_block_stop", json!({"index": 0})),
            ("message_delta", json!({"delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 8}})),
            ("message_stop", json!({})),
        ]);

        let captured = accumulate_sse(&buffer);
        assert_eq!(captured.task_invocations.len(), 1);
        assert_eq!(captured.task_invocations[0].name, "Task");
        assert_eq!(
            captured.task_invocations[0].prompt_text(),
            Some("do a thing")
        );
    }

    #[test]
    fn stream_cut_before_message_stop_is_flagged_truncated() {
        let buffer = sse(&[
            ("message_start", json!({"message": {"id": "msg_3", "model": "claude-3-7-sonnet", "usage": {"input_tokens": 5}}})),
            ("content_block_start", json!({"index": 0, "content_block": {"type": "text", "text": ""}})),
            ("content_block_delta", json!({"index": 0, "delta": {"type": "text_delta", "text": "partial"}})),
        ]);

        let captured = accumulate_sse(&buffer);
        assert_eq!(captured.error.as_deref(), Some("stream_truncated"));
        // The open block never saw `content_block_stop`, so it never made
        // it into the finished content array at all.
        assert_eq!(captured.response_body["content"], json!([]));
    }

    #[test]
    fn explicit_error_event_is_preserved() {
        let buffer = sse(&[("error", json!({"error": {"message": "overloaded_error"}}))]);
        let captured = accumulate_sse(&buffer);
        assert_eq!(captured.error.as_deref(), Some("overloaded_error"));
    }
}
