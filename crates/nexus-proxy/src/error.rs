use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Client-facing errors for the HTTP surface (spec §7). Each variant maps
/// to one status code and a structured body shaped like Anthropic's own
/// error envelope, so clients already parsing Anthropic errors don't need
/// a special case for the proxy's own failures.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing or invalid client credentials")]
    AuthFailed,

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("request body was not valid JSON: {0}")]
    InvalidRequest(String),

    #[error("analysis not found")]
    AnalysisNotFound,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::AuthFailed => StatusCode::UNAUTHORIZED,
            ProxyError::RefreshFailed(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::AnalysisNotFound => StatusCode::NOT_FOUND,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::AuthFailed => "authentication_error",
            ProxyError::RefreshFailed(_) => "refresh_error",
            ProxyError::UpstreamUnavailable(_) => "upstream_unavailable",
            ProxyError::UpstreamTimeout => "upstream_timeout",
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::AnalysisNotFound => "not_found_error",
            ProxyError::Internal(_) => "api_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
