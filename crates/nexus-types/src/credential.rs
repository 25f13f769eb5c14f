use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-domain credential, modeled as a tagged union so refresh logic lives
/// only on the `OAuth` branch (spec §9 "heterogeneous credential variants").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    ApiKey {
        api_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_api_key: Option<String>,
    },
    OAuth {
        oauth: OAuthState,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_api_key: Option<String>,
    },
}

/// OAuth token state kept for a single domain's credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub is_max: bool,
}

impl Credential {
    pub fn client_api_key(&self) -> Option<&str> {
        match self {
            Credential::ApiKey { client_api_key, .. } => client_api_key.as_deref(),
            Credential::OAuth { client_api_key, .. } => client_api_key.as_deref(),
        }
    }

    /// True once `now + skew >= expires_at`. Only meaningful for `OAuth`.
    pub fn oauth_needs_refresh(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match self {
            Credential::OAuth { oauth, .. } => now + skew >= oauth.expires_at,
            Credential::ApiKey { .. } => false,
        }
    }
}
