use thiserror::Error;

/// Errors surfaced while leasing, assembling, or scoring a single analysis
/// job. Every variant here maps to a `retry_analysis` call rather than a
/// process-level failure (spec §4.7, §7) — the worker logs and reverts the
/// job to `pending` instead of propagating.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("storage operation failed: {0}")]
    Storage(String),

    #[error("LLM call failed: {0}")]
    LlmCallFailed(String),

    #[error("failed to parse analysis response: {0}")]
    ParseFailed(String),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
