use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nexus_credentials::CredentialStore;
use nexus_storage::Storage;

use crate::config::NexusConfig;

/// Shared handles wired together once at startup and cloned (cheaply — an
/// `Arc` internally) into every request handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub credentials: Arc<CredentialStore>,
    pub http: reqwest::Client,
    pub config: Arc<NexusConfig>,
    /// Whether the analysis worker was started in this process; `GET
    /// /status` reports it without implying anything about its current
    /// poll cycle (spec §2 "supplemented: status endpoint").
    pub worker_enabled: bool,
    pub shutting_down: Arc<AtomicBool>,
}
