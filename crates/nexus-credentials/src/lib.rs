//! C1 — Credential Store.
//!
//! Loads per-domain credentials (API key or OAuth with refresh token) from
//! JSON files in a credentials directory, and refreshes OAuth tokens under
//! a per-domain single-flight: concurrent callers for the same domain
//! observe exactly one upstream refresh call, and losers simply wait for
//! the winner's token (spec §4.1, §5, §8 scenario 5).

pub mod error;
mod refresh;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use nexus_types::credential::{Credential, OAuthState};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

pub use error::{CredentialError, CredentialResult};

/// Refresh proactively once the token expires within this window (spec
/// §4.1: "refreshing if `now + 60s >= expires_at`").
const REFRESH_SKEW: i64 = 60;

/// Process-wide cache of per-domain credentials, backed by
/// `<domain>.credentials.json` files under `dir`.
pub struct CredentialStore {
    dir: PathBuf,
    http: reqwest::Client,
    refresh_url: String,
    cache: RwLock<HashMap<String, Credential>>,
    refresh_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>, refresh_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            http: reqwest::Client::new(),
            refresh_url: refresh_url.into(),
            cache: RwLock::new(HashMap::new()),
            refresh_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    fn credential_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{domain}.credentials.json"))
    }

    /// `Lookup(domain) -> Credential | missing`. Serves from the in-memory
    /// cache; falls back to disk on a cache miss.
    pub async fn lookup(&self, domain: &str) -> CredentialResult<Credential> {
        if let Some(cred) = self.cache.read().await.get(domain).cloned() {
            return Ok(cred);
        }

        let path = self.credential_path(domain);
        let cred = load_credential_file(&path).await?;

        self.cache
            .write()
            .await
            .insert(domain.to_string(), cred.clone());
        Ok(cred)
    }

    /// `EnsureFresh(domain) -> access_token`. For an `ApiKey` credential
    /// this just returns the key. For `OAuth`, refreshes under a
    /// per-domain single-flight when the token is within `REFRESH_SKEW`
    /// seconds of expiring.
    pub async fn ensure_fresh(&self, domain: &str) -> CredentialResult<String> {
        let cred = self.lookup(domain).await?;

        let oauth = match &cred {
            Credential::ApiKey { api_key, .. } => return Ok(api_key.clone()),
            Credential::OAuth { oauth, .. } => oauth.clone(),
        };

        if !needs_refresh(&oauth) {
            return Ok(oauth.access_token);
        }

        let lock = self.domain_lock(domain).await;
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another caller may have already
        // refreshed while we were waiting (the single-flight contract).
        let cred = self.lookup_uncached(domain).await?;
        let oauth = match cred {
            Credential::ApiKey { api_key, .. } => return Ok(api_key),
            Credential::OAuth { oauth, .. } => oauth,
        };

        if !needs_refresh(&oauth) {
            return Ok(oauth.access_token);
        }

        if oauth.refresh_token.is_empty() {
            return Err(CredentialError::NoRefreshToken(domain.to_string()));
        }

        info!(domain, "refreshing OAuth token");
        let refreshed = refresh::refresh(&self.http, &self.refresh_url, domain, &oauth.refresh_token)
            .await
            .inspect_err(|e| warn!(domain, error = %e, "OAuth refresh failed"))?;

        let new_oauth = OAuthState {
            access_token: refreshed.access_token.clone(),
            refresh_token: refreshed.refresh_token,
            expires_at: refreshed.expires_at,
            scopes: refreshed.scopes,
            is_max: oauth.is_max,
        };

        self.persist_oauth(domain, new_oauth.clone()).await?;
        Ok(new_oauth.access_token)
    }

    /// Fetches the credential directly from disk, bypassing the cache, then
    /// refreshes the cache. Used for the post-lock re-check so a losing
    /// caller observes the winner's write.
    async fn lookup_uncached(&self, domain: &str) -> CredentialResult<Credential> {
        let path = self.credential_path(domain);
        let cred = load_credential_file(&path).await?;
        self.cache
            .write()
            .await
            .insert(domain.to_string(), cred.clone());
        Ok(cred)
    }

    async fn domain_lock(&self, domain: &str) -> Arc<AsyncMutex<()>> {
        self.refresh_locks
            .lock()
            .await
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Atomically updates the `oauth` branch of a domain's credential on
    /// disk (write-temp-then-rename) and refreshes the in-memory cache,
    /// preserving any non-OAuth fields (`client_api_key`).
    async fn persist_oauth(&self, domain: &str, new_oauth: OAuthState) -> CredentialResult<()> {
        let existing = self.cache.read().await.get(domain).cloned();
        let client_api_key = existing.as_ref().and_then(|c| c.client_api_key().map(str::to_string));

        let updated = Credential::OAuth {
            oauth: new_oauth,
            client_api_key,
        };

        let path = self.credential_path(domain);
        write_credential_file(&path, &updated).await?;

        self.cache
            .write()
            .await
            .insert(domain.to_string(), updated);
        Ok(())
    }
}

fn needs_refresh(oauth: &OAuthState) -> bool {
    Utc::now() + Duration::seconds(REFRESH_SKEW) >= oauth.expires_at
}

async fn load_credential_file(path: &Path) -> CredentialResult<Credential> {
    let path = path.to_path_buf();
    let domain_label = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    tokio::task::spawn_blocking(move || -> CredentialResult<Credential> {
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CredentialError::NotFound(domain_label.clone())
            } else {
                CredentialError::Io(e.to_string())
            }
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CredentialError::Malformed(domain_label.clone(), e.to_string()))
    })
    .await
    .map_err(|e| CredentialError::Io(e.to_string()))?
}

/// Writes to `<file>.tmp`, then renames over the target, so a reader never
/// observes a partially-written credential file (spec §4.1, §6).
async fn write_credential_file(path: &Path, cred: &Credential) -> CredentialResult<()> {
    let path = path.to_path_buf();
    let cred = cred.clone();

    tokio::task::spawn_blocking(move || -> CredentialResult<()> {
        let tmp_path = path.with_extension("credentials.json.tmp");
        let bytes = serde_json::to_vec_pretty(&cred)
            .map_err(|e| CredentialError::WriteFailed(path.display().to_string(), e.to_string()))?;

        let mut file = std::fs::File::create(&tmp_path)?;
        use std::io::Write;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &path)
            .map_err(|e| CredentialError::WriteFailed(path.display().to_string(), e.to_string()))?;
        debug!(path = %path.display(), "wrote credential file");
        Ok(())
    })
    .await
    .map_err(|e| CredentialError::Io(e.to_string()))?
}
