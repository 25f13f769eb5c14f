//! C8 — Prompt Truncator.
//!
//! Keeps a conversation's token count under a configured budget before it is
//! handed to the analysis worker's LLM call (spec §4.8). Two truncation
//! moves compose:
//!
//! - message-level: any single message whose content exceeds the per-message
//!   token allowance is truncated in place, keeping a symmetric slice of its
//!   start and end around a `"[CONTENT TRUNCATED]"` sentinel.
//! - conversation-level: once every message individually fits, the head and
//!   tail runs of messages are kept verbatim and everything between them is
//!   collapsed into a single `"[...conversation truncated...]"` marker.
//!
//! Both moves only ever remove content from the middle — the first and last
//! messages a caller passed in are always present in the output, possibly
//! themselves truncated, never dropped outright.

use std::sync::OnceLock;

use serde_json::{json, Value};
use tiktoken_rs::CoreBPE;

const TRUNCATION_SENTINEL: &str = "[CONTENT TRUNCATED]";
const CONVERSATION_MARKER: &str = "[...conversation truncated...]";

/// Knobs for truncation, named after the spec's prompt-assembly
/// configuration (`headMessages`, `tailMessages`, `inputTargetTokens`,
/// `truncateFirstNTokens`, `truncateLastMTokens`).
#[derive(Debug, Clone)]
pub struct TruncationConfig {
    /// Messages kept verbatim (subject to per-message truncation) from the
    /// start of the conversation.
    pub head_messages: usize,
    /// Messages kept verbatim (subject to per-message truncation) from the
    /// end of the conversation.
    pub tail_messages: usize,
    /// Tokens of a single message's content kept from its start when that
    /// message exceeds `truncate_first_n_tokens + truncate_last_m_tokens`.
    pub truncate_first_n_tokens: usize,
    /// Tokens of a single message's content kept from its end under the
    /// same condition.
    pub truncate_last_m_tokens: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            head_messages: 2,
            tail_messages: 4,
            truncate_first_n_tokens: 200,
            truncate_last_m_tokens: 200,
        }
    }
}

/// Approximates the Claude family's tokenizer with `cl100k_base`, the
/// closest publicly available encoding (spec §9 permits an approximation
/// here; exact Claude-tokenizer parity is out of scope).
pub struct Tokenizer {
    bpe: CoreBPE,
}

fn shared_bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base vocab is bundled"))
}

impl Tokenizer {
    pub fn new() -> Self {
        Self { bpe: shared_bpe().clone() }
    }

    /// `countTokens(text)`.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    fn count_message(&self, message: &Value) -> usize {
        self.count_tokens(&message_text(message))
    }

    fn count_all(&self, messages: &[Value]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the text a message contributes to the prompt, for token
/// counting purposes. Unlike `nexus_hash`'s normalization this keeps
/// everything verbatim — counting must reflect exactly what will be sent
/// upstream, reminders included.
fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(content_item_text)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn content_item_text(item: &Value) -> String {
    match item.get("type").and_then(Value::as_str) {
        Some("text") => item.get("text").and_then(Value::as_str).unwrap_or("").to_string(),
        Some("tool_use") => item
            .get("input")
            .map(|v| v.to_string())
            .unwrap_or_default(),
        Some("tool_result") => item
            .get("content")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        _ => item.to_string(),
    }
}

/// Replaces `message`'s content with a symmetric head/tail slice around
/// `TRUNCATION_SENTINEL`, keeping at most `first_n` tokens from the start
/// and `last_m` tokens from the end of its text.
fn truncate_message_content(tokenizer: &Tokenizer, message: &Value, first_n: usize, last_m: usize) -> Value {
    let text = message_text(message);
    let tokens = tokenizer.bpe.encode_ordinary(&text);
    if tokens.len() <= first_n + last_m {
        return message.clone();
    }

    let head_tokens = &tokens[..first_n];
    let tail_tokens = &tokens[tokens.len() - last_m..];
    let head_text = tokenizer.bpe.decode(head_tokens.to_vec()).unwrap_or_default();
    let tail_text = tokenizer.bpe.decode(tail_tokens.to_vec()).unwrap_or_default();

    let new_content = format!("{head_text}\n{TRUNCATION_SENTINEL}\n{tail_text}");

    let mut out = message.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("content".to_string(), Value::String(new_content));
    }
    out
}

/// `truncateConversation(messages, budget, config) -> messages'`.
///
/// Applies per-message truncation first, then — if the conversation as a
/// whole still exceeds `budget` — collapses the middle run of messages
/// into a single marker, keeping `config.head_messages` from the start and
/// `config.tail_messages` from the end. If even that is not enough (an
/// adversarial budget smaller than the head/tail slices alone require),
/// the per-message cap is halved and reapplied repeatedly until the
/// output fits or the cap bottoms out, guaranteeing the output never
/// exceeds `budget` except when a single irreducible message already does.
pub fn truncate_conversation(
    tokenizer: &Tokenizer,
    messages: &[Value],
    budget: usize,
    config: &TruncationConfig,
) -> Vec<Value> {
    if messages.is_empty() {
        return Vec::new();
    }

    let mut first_n = config.truncate_first_n_tokens;
    let mut last_m = config.truncate_last_m_tokens;

    let mut per_message_capped: Vec<Value> = messages
        .iter()
        .map(|m| truncate_message_content(tokenizer, m, first_n, last_m))
        .collect();

    if tokenizer.count_all(&per_message_capped) <= budget {
        return per_message_capped;
    }

    loop {
        let assembled = assemble(&per_message_capped, config.head_messages, config.tail_messages);
        if tokenizer.count_all(&assembled) <= budget {
            return assembled;
        }

        if first_n <= 1 && last_m <= 1 {
            // Cannot shrink further; return the best effort rather than loop
            // forever. Only reachable with a budget too small to hold even
            // one token per kept message.
            return assembled;
        }

        first_n = (first_n / 2).max(1);
        last_m = (last_m / 2).max(1);
        per_message_capped = messages
            .iter()
            .map(|m| truncate_message_content(tokenizer, m, first_n, last_m))
            .collect();
    }
}

/// Collapses everything strictly between the first `head` and last `tail`
/// messages into one marker message, or returns `messages` unchanged if
/// there's nothing to collapse.
fn assemble(messages: &[Value], head: usize, tail: usize) -> Vec<Value> {
    let len = messages.len();
    if len <= head + tail {
        return messages.to_vec();
    }

    let mut out = Vec::with_capacity(head + tail + 1);
    out.extend_from_slice(&messages[..head]);
    out.push(marker_message());
    out.extend_from_slice(&messages[len - tail..]);
    out
}

fn marker_message() -> Value {
    json!({
        "role": "user",
        "content": CONVERSATION_MARKER,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, text: &str) -> Value {
        json!({ "role": role, "content": text })
    }

    #[test]
    fn counts_tokens_for_plain_text() {
        let tok = Tokenizer::new();
        assert!(tok.count_tokens("hello world") > 0);
        assert_eq!(tok.count_tokens(""), 0);
    }

    #[test]
    fn leaves_small_conversation_untouched() {
        let tok = Tokenizer::new();
        let messages = vec![msg("user", "hi"), msg("assistant", "hello there")];
        let config = TruncationConfig::default();
        let out = truncate_conversation(&tok, &messages, 10_000, &config);
        assert_eq!(out, messages);
    }

    #[test]
    fn collapses_middle_when_over_budget() {
        let tok = Tokenizer::new();
        let mut messages = Vec::new();
        for i in 0..20 {
            messages.push(msg("user", &format!("message number {i} with some padding text")));
        }
        let config = TruncationConfig {
            head_messages: 2,
            tail_messages: 2,
            truncate_first_n_tokens: 50,
            truncate_last_m_tokens: 50,
        };

        let out = truncate_conversation(&tok, &messages, 40, &config);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], messages[0]);
        assert_eq!(out[1], messages[1]);
        assert_eq!(out[2]["content"], CONVERSATION_MARKER);
        assert_eq!(out[3], messages[18]);
        assert_eq!(out[4], messages[19]);
        assert!(tok.count_all(&out) <= 40);
    }

    #[test]
    fn truncates_an_oversized_single_message_symmetrically() {
        let tok = Tokenizer::new();
        let long_text = (0..2000).map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        let messages = vec![msg("user", &long_text)];
        let config = TruncationConfig {
            head_messages: 2,
            tail_messages: 4,
            truncate_first_n_tokens: 10,
            truncate_last_m_tokens: 10,
        };

        let out = truncate_conversation(&tok, &messages, 10_000, &config);
        assert_eq!(out.len(), 1);
        let content = out[0]["content"].as_str().unwrap();
        assert!(content.contains(TRUNCATION_SENTINEL));
        assert!(content.starts_with('0'));
    }

    #[test]
    fn output_never_exceeds_budget_across_varied_inputs() {
        let tok = Tokenizer::new();
        let config = TruncationConfig::default();
        for n in [1, 5, 12, 50] {
            let messages: Vec<Value> = (0..n)
                .map(|i| msg("user", &format!("entry {i}: {}", "word ".repeat(30))))
                .collect();
            for budget in [5usize, 50, 500] {
                let out = truncate_conversation(&tok, &messages, budget, &config);
                let count = tok.count_all(&out);
                assert!(
                    count <= budget || messages.iter().all(|m| tok.count_message(m) > budget),
                    "budget {budget} exceeded for n={n}: got {count}"
                );
            }
        }
    }

    #[test]
    fn first_and_last_message_are_never_dropped() {
        let tok = Tokenizer::new();
        let messages: Vec<Value> = (0..30)
            .map(|i| msg("user", &format!("line {i} {}", "x".repeat(20))))
            .collect();
        let config = TruncationConfig::default();
        let out = truncate_conversation(&tok, &messages, 30, &config);

        let first_text = out.first().unwrap()["content"].as_str().unwrap().to_string();
        let last_text = out.last().unwrap()["content"].as_str().unwrap().to_string();
        assert!(first_text.contains("line 0"));
        assert!(last_text.contains("line 29"));
    }
}
