use nexus_types::request::Request;
use nexus_truncate::{truncate_conversation, Tokenizer, TruncationConfig};
use serde_json::{json, Value};

/// Fixed instructions sent ahead of the transcript; the worker only ever
/// asks for one shape of answer so the model can be held to it strictly.
pub const SYSTEM_PROMPT: &str = "You are analyzing a recorded conversation between a developer and an AI coding assistant. \
Read the transcript below and respond with a single JSON object (optionally wrapped in a ```json code fence) with exactly these fields: \
`summary` (a 2-4 sentence plain-language summary of what the conversation accomplished), \
`topics` (an array of short string tags for the subject matter touched), \
`outcome` (one of \"completed\", \"abandoned\", \"blocked\", or \"ongoing\"). \
Do not include any text outside the JSON object.";

/// Reconstructs the conversation transcript an analysis job summarizes.
/// Anthropic Messages API requests carry the full message history on every
/// turn, so the last request in a branch already holds every prior
/// message; this appends its own response so the transcript includes the
/// final assistant turn too (spec §4.7 step 3).
pub fn assemble_transcript(requests: &[Request]) -> Vec<Value> {
    let Some(last) = requests.last() else {
        return Vec::new();
    };

    let mut messages: Vec<Value> = last
        .body
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if let Some(response) = &last.response_body {
        if let Some(content) = response.get("content") {
            messages.push(json!({ "role": "assistant", "content": content.clone() }));
        }
    }

    messages
}

/// Truncates the transcript to `max_context_tokens` (spec §4.7 step 4,
/// §4.8) and renders it as the JSON blob appended after [`SYSTEM_PROMPT`].
pub fn build_prompt(
    tokenizer: &Tokenizer,
    requests: &[Request],
    max_context_tokens: usize,
    truncation: &TruncationConfig,
) -> String {
    let transcript = assemble_transcript(requests);
    let truncated = truncate_conversation(tokenizer, &transcript, max_context_tokens, truncation);
    let transcript_json = serde_json::to_string_pretty(&truncated).unwrap_or_default();
    format!("{SYSTEM_PROMPT}\n\nTranscript:\n{transcript_json}")
}
