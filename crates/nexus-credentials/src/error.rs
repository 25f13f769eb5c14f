use thiserror::Error;

/// Errors that can occur while loading or refreshing a domain's credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential file for domain {0}")]
    NotFound(String),

    #[error("credential file for domain {0} is malformed: {1}")]
    Malformed(String, String),

    #[error("domain {0} has no refresh token on file")]
    NoRefreshToken(String),

    #[error("refresh rejected by upstream for domain {0}: {1}")]
    RefreshRejected(String, String),

    #[error("failed to write credential file for domain {0}: {1}")]
    WriteFailed(String, String),

    #[error("i/o error: {0}")]
    Io(String),
}

pub type CredentialResult<T> = Result<T, CredentialError>;

impl From<std::io::Error> for CredentialError {
    fn from(err: std::io::Error) -> Self {
        CredentialError::Io(err.to_string())
    }
}
