use axum::http::HeaderMap;
use nexus_credentials::CredentialStore;

use crate::error::ProxyError;

/// Authenticates a client call against the domain's configured
/// `client_api_key` (spec §4.5 step 1, §6). The domain is the `Host`
/// header the client connected with; each domain's credential file may
/// carry its own client-facing key so one proxy instance can front several
/// upstream accounts.
pub async fn authenticate_client(
    headers: &HeaderMap,
    domain: &str,
    credentials: &CredentialStore,
) -> Result<(), ProxyError> {
    let presented = bearer_token(headers).ok_or(ProxyError::AuthFailed)?;

    let credential = credentials
        .lookup(domain)
        .await
        .map_err(|_| ProxyError::AuthFailed)?;

    match credential.client_api_key() {
        Some(expected) if expected == presented => Ok(()),
        _ => Err(ProxyError::AuthFailed),
    }
}

/// Checks the dashboard-only management header (spec §6: "a dashboard-only
/// header `X-Dashboard-Key` on management endpoints").
pub fn authenticate_dashboard(headers: &HeaderMap, dashboard_api_key: Option<&str>) -> Result<(), ProxyError> {
    let expected = dashboard_api_key.ok_or(ProxyError::AuthFailed)?;
    let presented = headers
        .get("x-dashboard-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ProxyError::AuthFailed)?;

    if presented == expected {
        Ok(())
    } else {
        Err(ProxyError::AuthFailed)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Extracts the domain a request should be authenticated and routed
/// against from its `Host` header.
pub fn request_domain(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer cnp_live_abc"));
        assert_eq!(bearer_token(&headers), Some("cnp_live_abc"));
    }

    #[test]
    fn bearer_token_absent_without_header() {
        let headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn request_domain_strips_port() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::HOST, HeaderValue::from_static("example.com:3000"));
        assert_eq!(request_domain(&headers).as_deref(), Some("example.com"));
    }

    #[test]
    fn dashboard_auth_rejects_mismatched_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-dashboard-key", HeaderValue::from_static("wrong"));
        assert!(authenticate_dashboard(&headers, Some("right")).is_err());
    }

    #[test]
    fn dashboard_auth_accepts_matching_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-dashboard-key", HeaderValue::from_static("right"));
        assert!(authenticate_dashboard(&headers, Some("right")).is_ok());
    }
}
