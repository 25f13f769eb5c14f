//! Content-addressed hashing for Anthropic Messages-API-shaped JSON.
//!
//! Pure functions, no I/O: every hash depends only on its argument's
//! content, and re-normalizing the same content always produces the same
//! digest (spec §4.2, §8). The `<system-reminder>` filtering rule lives
//! entirely in [`normalize_content`] so every caller gets it for free —
//! doing it at call sites instead would let hashes silently diverge.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Marker whose presence at the start of a trimmed text block drops that
/// content item from hashing entirely. Case-sensitive per spec §9.
const SYSTEM_REMINDER_MARKER: &str = "<system-reminder>";

/// Separator joining normalized content items, and joining per-message
/// hashes in [`hash_messages_only`]. Chosen to be a byte sequence that can
/// never appear inside normalized text (itself hex/JSON).
const SEP: &str = "\u{1e}";

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalizes a single content item and returns `None` if it's a
/// `<system-reminder>` text block that should be filtered out.
fn normalize_content_item(item: &Value) -> Option<String> {
    let kind = item.get("type").and_then(Value::as_str).unwrap_or("unknown");

    match kind {
        "text" => {
            let text = item.get("text").and_then(Value::as_str).unwrap_or("");
            let trimmed = text.trim();
            if trimmed.starts_with(SYSTEM_REMINDER_MARKER) {
                return None;
            }
            Some(format!("text:{trimmed}"))
        }
        "tool_use" => {
            let name = item.get("name").and_then(Value::as_str).unwrap_or("");
            let id = item.get("id").and_then(Value::as_str).unwrap_or("");
            let input = item
                .get("input")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "null".to_string());
            Some(format!("tool_use:{name}:{id}:{input}"))
        }
        "tool_result" => {
            let tool_use_id = item
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or("");
            let content = match item.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Some(format!("tool_result:{tool_use_id}:{content}"))
        }
        other => {
            let raw = item.to_string();
            Some(format!("{other}:{raw}"))
        }
    }
}

/// Normalizes message `content`, which is either a plain string or an array
/// of typed content blocks, into a single canonical string.
fn normalize_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(normalize_content_item)
            .enumerate()
            .map(|(i, normalized)| format!("{i}:{normalized}"))
            .collect::<Vec<_>>()
            .join(SEP),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `SHA-256(role || SEP || normalized_content)` as lowercase hex.
pub fn hash_message(message: &Value) -> String {
    let role = message.get("role").and_then(Value::as_str).unwrap_or("");
    let content = message
        .get("content")
        .cloned()
        .unwrap_or(Value::Null);
    let normalized = normalize_content(&content);
    sha256_hex(&format!("{role}{SEP}{normalized}"))
}

/// `SHA-256(join(SEP, hash_message(m) for m in msgs))`. Empty slice hashes
/// the empty join (a stable, well-defined digest, never used as a "no
/// messages" sentinel by callers — they check length first).
pub fn hash_messages_only(messages: &[Value]) -> String {
    let joined = messages
        .iter()
        .map(hash_message)
        .collect::<Vec<_>>()
        .join(SEP);
    sha256_hex(&joined)
}

/// Hash of the message sequence with the last two messages removed, or
/// `None` if fewer than 3 messages are present (spec §3, §8).
pub fn parent_hash(messages: &[Value]) -> Option<String> {
    if messages.len() < 3 {
        return None;
    }
    Some(hash_messages_only(&messages[..messages.len() - 2]))
}

/// Hashes a system prompt, which may be absent, a plain string, or an array
/// of content blocks. Returns `None` when there is no text left to hash
/// after trimming/filtering (spec §4.2, §8).
pub fn hash_system_prompt(system: Option<&Value>) -> Option<String> {
    let system = system?;

    let text = match system {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| {
                let t = item.get("text").and_then(Value::as_str)?.trim();
                if t.starts_with(SYSTEM_REMINDER_MARKER) || t.is_empty() {
                    None
                } else {
                    Some(t.to_string())
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };

    if text.trim().is_empty() {
        None
    } else {
        Some(sha256_hex(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_system_prompt_is_none_for_absent_empty_or_blank() {
        assert_eq!(hash_system_prompt(None), None);
        assert_eq!(hash_system_prompt(Some(&json!(""))), None);
        assert_eq!(hash_system_prompt(Some(&json!("   "))), None);
    }

    #[test]
    fn hash_system_prompt_hashes_trimmed_string() {
        let a = hash_system_prompt(Some(&json!("be helpful")));
        let b = hash_system_prompt(Some(&json!("  be helpful  ")));
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn hash_message_is_deterministic() {
        let msg = json!({"role": "user", "content": "hello"});
        assert_eq!(hash_message(&msg), hash_message(&msg));
    }

    #[test]
    fn hash_message_trims_string_content() {
        let a = hash_message(&json!({"role": "user", "content": "hi"}));
        let b = hash_message(&json!({"role": "user", "content": "  hi  "}));
        assert_eq!(a, b);
    }

    #[test]
    fn system_reminder_is_filtered_regardless_of_position() {
        let reminder = json!({"type": "text", "text": "<system-reminder>ignore me</system-reminder>"});
        let real = json!({"type": "text", "text": "analyze X"});

        let msg_front = json!({"role": "user", "content": [reminder.clone(), real.clone()]});
        let msg_back = json!({"role": "user", "content": [real.clone(), reminder.clone()]});
        let msg_none = json!({"role": "user", "content": [real.clone()]});

        let h1 = hash_message(&msg_front);
        let h2 = hash_message(&msg_back);
        let h3 = hash_message(&msg_none);
        assert_eq!(h1, h2);
        assert_eq!(h2, h3);
    }

    #[test]
    fn system_reminder_marker_is_case_sensitive() {
        let not_a_reminder =
            json!({"type": "text", "text": "<SYSTEM-REMINDER>not filtered</SYSTEM-REMINDER>"});
        let msg_a = json!({"role": "user", "content": [not_a_reminder]});
        let msg_b = json!({"role": "user", "content": []});
        assert_ne!(hash_message(&msg_a), hash_message(&msg_b));
    }

    #[test]
    fn parent_hash_requires_at_least_three_messages() {
        let msgs = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
        ];
        assert_eq!(parent_hash(&msgs), None);

        let msgs = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
            json!({"role": "user", "content": "more"}),
        ];
        assert!(parent_hash(&msgs).is_some());
    }

    #[test]
    fn parent_hash_drops_last_two_messages() {
        let msgs = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
            json!({"role": "user", "content": "more"}),
            json!({"role": "assistant", "content": "sure"}),
        ];
        let expected = hash_messages_only(&msgs[..2]);
        assert_eq!(parent_hash(&msgs), Some(expected));
    }

    #[test]
    fn tool_use_and_tool_result_are_distinguished_by_kind_tag() {
        let tool_use = json!({"type": "tool_use", "name": "Task", "id": "t1", "input": {"prompt": "x"}});
        let tool_result = json!({"type": "tool_result", "tool_use_id": "t1", "content": "ok"});
        let msg_a = json!({"role": "assistant", "content": [tool_use]});
        let msg_b = json!({"role": "assistant", "content": [tool_result]});
        assert_ne!(hash_message(&msg_a), hash_message(&msg_b));
    }
}
