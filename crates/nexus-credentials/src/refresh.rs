use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CredentialError, CredentialResult};

/// `POST` body for the OAuth refresh endpoint (spec §6).
#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
}

/// Response shape from the OAuth refresh endpoint.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    scopes: Vec<String>,
}

/// Result of a successful refresh, ready to be written back into the
/// credential's `OAuthState`.
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

/// Calls the upstream OAuth refresh endpoint for a single domain. The
/// caller is responsible for holding the per-domain single-flight guard
/// (spec §4.1, §5) — this function performs exactly one HTTP call.
pub async fn refresh(
    http: &reqwest::Client,
    refresh_url: &str,
    domain: &str,
    refresh_token: &str,
) -> CredentialResult<RefreshedToken> {
    let body = RefreshRequest {
        grant_type: "refresh_token",
        refresh_token,
    };

    let response = http
        .post(refresh_url)
        .json(&body)
        .send()
        .await
        .map_err(|e| CredentialError::RefreshRejected(domain.to_string(), e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(CredentialError::RefreshRejected(
            domain.to_string(),
            format!("upstream returned {status}: {text}"),
        ));
    }

    let parsed: RefreshResponse = response
        .json()
        .await
        .map_err(|e| CredentialError::RefreshRejected(domain.to_string(), e.to_string()))?;

    Ok(RefreshedToken {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
        expires_at: Utc::now() + Duration::seconds(parsed.expires_in),
        scopes: parsed.scopes,
    })
}
