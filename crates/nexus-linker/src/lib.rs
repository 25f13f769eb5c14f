//! C3 — Conversation Linker.
//!
//! Resolves each incoming request to `(conversation_id, branch_id,
//! parent_request_id, is_subtask, parent_task_request_id)` (spec §4.3).
//! Pure decision logic over the [`QueryExecutor`] trait: no SQL, no I/O of
//! its own, so it's unit-testable against an in-memory fake executor.

mod executor;

pub use executor::{CompactCandidate, LinkCandidate, QueryExecutor, SubtaskCandidate};

use chrono::{DateTime, Utc};
use nexus_types::TaskToolInvocation;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LinkerError {
    #[error("query executor failed: {0}")]
    Storage(String),
}

const SUBTASK_WINDOW_SECS: i64 = 60;
const COMPACT_MARKER_START: &str = "This session is being continued from a previous conversation";
const COMPACT_MARKER_SUMMARY: &str = "The conversation is summarized below:";
const COMPACT_COMPARE_LEN: usize = 512;
const SYSTEM_REMINDER_MARKER: &str = "<system-reminder>";

/// Inputs the linker needs for a single inbound request. Only `inference`
/// requests should be linked (spec §4.5); the caller is responsible for
/// that gate.
pub struct LinkInput<'a> {
    pub domain: &'a str,
    pub messages: &'a [Value],
    pub system: Option<&'a Value>,
    pub now: DateTime<Utc>,
}

/// The linkage fields to be written onto the new `Request` row.
#[derive(Debug, Clone)]
pub struct Linkage {
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub parent_request_id: Option<Uuid>,
    pub is_subtask: bool,
    pub parent_task_request_id: Option<Uuid>,
    pub current_message_hash: String,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
}

/// Runs the full priority-tier algorithm of spec §4.3 plus sub-task
/// detection.
pub async fn link(input: LinkInput<'_>, executor: &dyn QueryExecutor) -> Result<Linkage, LinkerError> {
    let current_message_hash = nexus_hash::hash_messages_only(input.messages);
    let parent_message_hash = nexus_hash::parent_hash(input.messages);
    let system_hash = nexus_hash::hash_system_prompt(input.system);

    // Tier 1: exact match (same parent hash AND same system hash).
    let mut matched: Option<LinkCandidate> = None;
    if let Some(phash) = parent_message_hash.as_deref() {
        let candidates = executor
            .query_by_hash(input.domain, phash, system_hash.as_deref())
            .await?;
        matched = pick_best(&candidates);
    }

    // Tier 2: summarization ("compact") continuation.
    let mut compact_branch: Option<(Uuid, String)> = None;
    if matched.is_none() {
        if let Some(summary) = extract_compact_summary(input.messages) {
            let candidates = executor.compact_candidates(input.domain).await?;
            if let Some(c) = pick_best_compact(&candidates, &summary) {
                let branch_id = format!("compact_{}", input.now.format("%H%M%S"));
                tracing::debug!(conversation_id = %c.conversation_id, branch_id, "compact continuation matched");
                compact_branch = Some((c.conversation_id, branch_id));
            }
        }
    }

    // Tier 3: fallback by parent hash only, ignoring system hash drift.
    if matched.is_none() && compact_branch.is_none() {
        if let Some(phash) = parent_message_hash.as_deref() {
            let candidates = executor.query_by_hash(input.domain, phash, None).await?;
            matched = pick_best(&candidates);
        }
    }

    let (conversation_id, branch_id, parent_request_id, mut is_subtask, mut parent_task_request_id) =
        if let Some(parent) = &matched {
            let branch_id = resolve_branch_id(executor, parent).await?;
            (
                parent.conversation_id,
                branch_id,
                Some(parent.request_id),
                parent.is_subtask,
                parent.parent_task_request_id,
            )
        } else if let Some((conversation_id, branch_id)) = compact_branch {
            (conversation_id, branch_id, None, false, None)
        } else {
            (Uuid::new_v4(), "main".to_string(), None, false, None)
        };

    // Sub-task detection runs whenever this request has no parent, whether
    // it's a genuinely fresh conversation or a compact continuation branch
    // root (spec §4.3: "runs regardless of the above... if the new request
    // has parent_request_id = null"). Otherwise inherit from the parent.
    if parent_request_id.is_none() {
        let (subtask, parent_task_id) = detect_subtask(&input, executor).await?;
        is_subtask = subtask;
        parent_task_request_id = parent_task_id;
    }

    Ok(Linkage {
        conversation_id,
        branch_id,
        parent_request_id,
        is_subtask,
        parent_task_request_id,
        current_message_hash,
        parent_message_hash,
        system_hash,
    })
}

/// Tiebreak: most recent timestamp first, then lexicographically larger
/// request id (spec §4.3 "Ordering").
fn pick_best(candidates: &[LinkCandidate]) -> Option<LinkCandidate> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.request_id.to_string().cmp(&b.request_id.to_string()))
        })
        .cloned()
}

fn pick_best_compact(candidates: &[CompactCandidate], summary: &str) -> Option<CompactCandidate> {
    let normalized_summary = normalize_and_truncate(summary);
    candidates
        .iter()
        .filter(|c| {
            let normalized_candidate = normalize_and_truncate(&c.final_assistant_text);
            !normalized_candidate.is_empty()
                && (normalized_candidate.starts_with(&normalized_summary)
                    || normalized_summary.starts_with(&normalized_candidate))
        })
        .max_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.request_id.to_string().cmp(&b.request_id.to_string()))
        })
        .cloned()
}

/// Decides whether a new child of `parent` keeps the parent's branch or
/// needs a fresh `branch_N`. The parent's branch stays with whichever child
/// is inserted first; since requests are immutable once written, this
/// falls out of insertion order rather than any retroactive update (spec
/// §4.3, §9 "branch naming races").
async fn resolve_branch_id(
    executor: &dyn QueryExecutor,
    parent: &LinkCandidate,
) -> Result<String, LinkerError> {
    let children = executor.children_of(parent.request_id).await?;
    if children.iter().any(|c| c.branch_id == parent.branch_id) {
        Ok(next_free_branch(&children))
    } else {
        Ok(parent.branch_id.clone())
    }
}

fn branch_n_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^branch_(\d+)$").expect("valid regex"))
}

/// Smallest unused `branch_N` label among `children`'s branch ids.
pub fn next_free_branch(children: &[LinkCandidate]) -> String {
    let max = children
        .iter()
        .filter_map(|c| branch_n_regex().captures(&c.branch_id))
        .filter_map(|cap| cap[1].parse::<u32>().ok())
        .max();
    format!("branch_{}", max.map(|n| n + 1).unwrap_or(1))
}

/// Texts eligible for a verbatim sub-task / compact match: the whole string
/// for string content, or each non-reminder trimmed text item for array
/// content (spec §4.3 "verbatim or, for array content, one of its text
/// items matches").
fn candidate_texts(content: &Value) -> Vec<String> {
    match content {
        Value::String(s) => vec![s.trim().to_string()],
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
            .collect(),
        _ => Vec::new(),
    }
}

/// Concatenated text of a message's content, used for marker detection
/// (where the marker may span normal prose rather than a single block).
fn joined_text(content: &Value) -> String {
    candidate_texts(content).join("\n")
}

fn first_user_message(messages: &[Value]) -> Option<&Value> {
    messages
        .iter()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
}

/// Extracts the summary text following the compact-continuation markers
/// from the first user message, if present.
fn extract_compact_summary(messages: &[Value]) -> Option<String> {
    let first = first_user_message(messages)?;
    let content = first.get("content").cloned().unwrap_or(Value::Null);
    let text = joined_text(&content);

    if !text.contains(COMPACT_MARKER_START) {
        return None;
    }
    let idx = text.find(COMPACT_MARKER_SUMMARY)?;
    let summary = text[idx + COMPACT_MARKER_SUMMARY.len()..].trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}

fn normalize_and_truncate(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(COMPACT_COMPARE_LEN).collect()
}

async fn detect_subtask(
    input: &LinkInput<'_>,
    executor: &dyn QueryExecutor,
) -> Result<(bool, Option<Uuid>), LinkerError> {
    let Some(first) = first_user_message(input.messages) else {
        return Ok((false, None));
    };
    let content = first.get("content").cloned().unwrap_or(Value::Null);
    let texts = candidate_texts(&content);
    if texts.is_empty() {
        return Ok((false, None));
    }

    let window_end = input.now;
    let window_start = window_end - chrono::Duration::seconds(SUBTASK_WINDOW_SECS);
    let candidates = executor.subtask_candidates(input.domain, window_end).await?;

    let mut best: Option<(&str, &TaskToolInvocation, DateTime<Utc>, Uuid)> = None;
    for candidate in &candidates {
        if candidate.timestamp < window_start || candidate.timestamp > window_end {
            continue;
        }
        for invocation in &candidate.invocations {
            let Some(prompt) = invocation.prompt_text() else {
                continue;
            };
            if texts.iter().any(|t| t == prompt.trim()) {
                let is_better = match &best {
                    None => true,
                    Some((_, _, best_ts, best_id)) => {
                        candidate.timestamp > *best_ts
                            || (candidate.timestamp == *best_ts
                                && candidate.request_id.to_string() > best_id.to_string())
                    }
                };
                if is_better {
                    best = Some((prompt, invocation, candidate.timestamp, candidate.request_id));
                }
            }
        }
    }

    Ok(match best {
        Some((_, _, _, request_id)) => (true, Some(request_id)),
        None => (false, None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeExecutor {
        requests: Mutex<Vec<LinkCandidate>>,
        compacts: Mutex<Vec<CompactCandidate>>,
        subtasks: Mutex<Vec<SubtaskCandidate>>,
        children: Mutex<std::collections::HashMap<Uuid, Vec<Uuid>>>,
    }

    impl FakeExecutor {
        fn push(&self, c: LinkCandidate, parent: Option<Uuid>) {
            if let Some(p) = parent {
                self.children.lock().unwrap().entry(p).or_default().push(c.request_id);
            }
            self.requests.lock().unwrap().push(c);
        }
    }

    #[async_trait]
    impl QueryExecutor for FakeExecutor {
        async fn query_by_hash(
            &self,
            _domain: &str,
            hash: &str,
            system_hash: Option<&str>,
        ) -> Result<Vec<LinkCandidate>, LinkerError> {
            Ok(self
                .requests
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.current_message_hash.as_deref() == Some(hash))
                .filter(|c| match system_hash {
                    Some(sh) => c.system_hash.as_deref() == Some(sh),
                    None => true,
                })
                .cloned()
                .collect())
        }

        async fn request_by_id(&self, id: Uuid) -> Result<Option<LinkCandidate>, LinkerError> {
            Ok(self
                .requests
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.request_id == id)
                .cloned())
        }

        async fn children_of(&self, parent_id: Uuid) -> Result<Vec<LinkCandidate>, LinkerError> {
            let children = self.children.lock().unwrap();
            let Some(ids) = children.get(&parent_id) else {
                return Ok(Vec::new());
            };
            let requests = self.requests.lock().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| requests.iter().find(|c| c.request_id == *id).cloned())
                .collect())
        }

        async fn subtask_candidates(
            &self,
            _domain: &str,
            _window_end: DateTime<Utc>,
        ) -> Result<Vec<SubtaskCandidate>, LinkerError> {
            Ok(self.subtasks.lock().unwrap().clone())
        }

        async fn compact_candidates(&self, _domain: &str) -> Result<Vec<CompactCandidate>, LinkerError> {
            Ok(self.compacts.lock().unwrap().clone())
        }
    }

    fn candidate(request_id: Uuid, conversation_id: Uuid, branch_id: &str, hash: &str, system_hash: Option<&str>, ts: DateTime<Utc>) -> LinkCandidate {
        LinkCandidate {
            request_id,
            conversation_id,
            branch_id: branch_id.to_string(),
            timestamp: ts,
            current_message_hash: Some(hash.to_string()),
            system_hash: system_hash.map(str::to_string),
            is_subtask: false,
            parent_task_request_id: None,
        }
    }

    #[tokio::test]
    async fn simple_continuation_links_to_existing_conversation() {
        let p_id = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let t0 = Utc::now() - chrono::Duration::seconds(30);

        let p_messages = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
        ];
        let p_hash = nexus_hash::hash_messages_only(&p_messages);

        let exec = FakeExecutor::default();
        exec.push(candidate(p_id, conv, "main", &p_hash, None, t0), None);

        let new_messages = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
            json!({"role": "user", "content": "more"}),
            json!({"role": "assistant", "content": "sure"}),
        ];

        let linkage = link(
            LinkInput { domain: "example.com", messages: &new_messages, system: None, now: Utc::now() },
            &exec,
        )
        .await
        .unwrap();

        assert_eq!(linkage.conversation_id, conv);
        assert_eq!(linkage.branch_id, "main");
        assert_eq!(linkage.parent_request_id, Some(p_id));
    }

    #[tokio::test]
    async fn divergent_second_child_gets_a_fresh_branch() {
        let p_id = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let t0 = Utc::now() - chrono::Duration::seconds(60);

        let p_messages = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
        ];
        let p_hash = nexus_hash::hash_messages_only(&p_messages);

        let exec = FakeExecutor::default();
        exec.push(candidate(p_id, conv, "main", &p_hash, None, t0), None);

        // First child already exists on "main".
        let first_child_id = Uuid::new_v4();
        exec.push(
            candidate(first_child_id, conv, "main", "unused", None, t0 + chrono::Duration::seconds(10)),
            Some(p_id),
        );

        let branch_messages = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
            json!({"role": "user", "content": "other"}),
            json!({"role": "assistant", "content": "different"}),
        ];

        let linkage = link(
            LinkInput { domain: "example.com", messages: &branch_messages, system: None, now: Utc::now() },
            &exec,
        )
        .await
        .unwrap();

        assert_eq!(linkage.conversation_id, conv);
        assert_eq!(linkage.parent_request_id, Some(p_id));
        assert_eq!(linkage.branch_id, "branch_1");
    }

    #[tokio::test]
    async fn compact_continuation_mints_compact_branch() {
        let conv = Uuid::new_v4();
        let prior_id = Uuid::new_v4();

        let exec = FakeExecutor::default();
        exec.compacts.lock().unwrap().push(CompactCandidate {
            request_id: prior_id,
            conversation_id: conv,
            timestamp: Utc::now() - chrono::Duration::minutes(5),
            final_assistant_text: "We refactored the auth module and fixed three bugs.".to_string(),
        });

        let messages = vec![json!({
            "role": "user",
            "content": "This session is being continued from a previous conversation that ran out of context. The conversation is summarized below: We refactored the auth module and fixed three bugs."
        })];

        let linkage = link(
            LinkInput { domain: "example.com", messages: &messages, system: None, now: Utc::now() },
            &exec,
        )
        .await
        .unwrap();

        assert_eq!(linkage.conversation_id, conv);
        assert_eq!(linkage.parent_request_id, None);
        assert!(Regex::new(r"^compact_\d{6}$").unwrap().is_match(&linkage.branch_id));
    }

    #[tokio::test]
    async fn subtask_detected_from_prior_task_invocation() {
        let parent_id = Uuid::new_v4();
        let now = Utc::now();

        let exec = FakeExecutor::default();
        exec.subtasks.lock().unwrap().push(SubtaskCandidate {
            request_id: parent_id,
            timestamp: now - chrono::Duration::seconds(5),
            invocations: vec![TaskToolInvocation {
                id: "t1".to_string(),
                name: "Task".to_string(),
                input: json!({"prompt": "analyze X"}),
            }],
        });

        let messages = vec![json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "<system-reminder>context</system-reminder>"},
                {"type": "text", "text": "analyze X"}
            ]
        })];

        let linkage = link(
            LinkInput { domain: "example.com", messages: &messages, system: None, now },
            &exec,
        )
        .await
        .unwrap();

        assert!(linkage.is_subtask);
        assert_eq!(linkage.parent_task_request_id, Some(parent_id));
        assert_eq!(linkage.parent_request_id, None);
    }

    #[tokio::test]
    async fn no_match_creates_new_conversation_root() {
        let exec = FakeExecutor::default();
        let messages = vec![json!({"role": "user", "content": "brand new thread"})];

        let linkage = link(
            LinkInput { domain: "example.com", messages: &messages, system: None, now: Utc::now() },
            &exec,
        )
        .await
        .unwrap();

        assert_eq!(linkage.branch_id, "main");
        assert_eq!(linkage.parent_request_id, None);
        assert!(!linkage.is_subtask);
    }

    #[test]
    fn next_free_branch_skips_used_numbers() {
        let mk = |branch: &str| LinkCandidate {
            request_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            branch_id: branch.to_string(),
            timestamp: Utc::now(),
            current_message_hash: None,
            system_hash: None,
            is_subtask: false,
            parent_task_request_id: None,
        };
        let children = vec![mk("main"), mk("branch_1"), mk("branch_3")];
        assert_eq!(next_free_branch(&children), "branch_4");
    }
}
