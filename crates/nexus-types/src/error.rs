use thiserror::Error;

/// Abstract error taxonomy from the design's error-handling section (spec
/// §7). Not every component produces every variant; each crate's own error
/// type converts into this one at the boundary where the abstract kind
/// actually matters (HTTP status mapping, worker bookkeeping).
#[derive(Debug, Error)]
pub enum NexusError {
    #[error("client authentication failed: {0}")]
    AuthFailed(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream responded with a 4xx; carries the status so it can be
    /// passed through unmodified.
    #[error("upstream rejected the request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    /// Upstream responded with a 5xx; carries the status so it can be
    /// passed through unmodified.
    #[error("upstream server error ({status}): {message}")]
    UpstreamServerError { status: u16, message: String },

    #[error("credential for domain {0} has expired")]
    CredentialExpired(String),

    #[error("OAuth token refresh failed for domain {0}: {1}")]
    RefreshFailed(String, String),

    #[error("stream ended unexpectedly: {0}")]
    StreamTruncated(String),

    #[error("storage operation failed: {0}")]
    StorageFailed(String),

    /// Linking resolved via tie-break rather than a single obvious match;
    /// not fatal, logged for visibility.
    #[error("linking ambiguous, resolved by tie-break: {0}")]
    LinkingAmbiguous(String),

    #[error("failed to parse analysis response: {0}")]
    AnalysisParseFailed(String),

    #[error("analysis LLM call failed: {0}")]
    AnalysisLLMFailed(String),

    #[error("analysis retries exhausted after {0} attempts")]
    RetryExhausted(u32),
}

impl From<serde_json::Error> for NexusError {
    fn from(err: serde_json::Error) -> Self {
        NexusError::StorageFailed(format!("json error: {err}"))
    }
}

pub type NexusResult<T> = Result<T, NexusError>;
