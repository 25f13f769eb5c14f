use serde_json::Value;

use crate::error::{AnalysisError, AnalysisResult};

/// Parses an LLM's raw text reply into the structured `analysis_data`
/// (spec §4.7 step 6): either a bare JSON object, or one wrapped in a
/// ` ```json ... ``` ` fence (models reliably do the latter even when
/// asked not to).
pub fn extract_json(raw: &str) -> AnalysisResult<Value> {
    let trimmed = raw.trim();

    if let Some(fenced) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(fenced) {
            return Ok(value);
        }
    }

    serde_json::from_str(trimmed).map_err(|e| AnalysisError::ParseFailed(e.to_string()))
}

/// Finds the first ` ``` ` fenced block, stripping an optional `json`
/// language tag, and returns its inner text.
fn extract_fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_open = &text[start + 3..];
    let after_open = after_open.strip_prefix("json").unwrap_or(after_open);
    let after_open = after_open.strip_prefix('\n').unwrap_or(after_open);
    let end = after_open.find("```")?;
    Some(after_open[..end].trim())
}
