mod auth;
mod classify;
mod config;
mod error;
mod routes;
mod shutdown;
mod state;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use nexus_analysis::{AnalysisLlm, AnalysisStore, GeminiClient, WorkerConfig};
use nexus_credentials::CredentialStore;
use nexus_storage::Storage;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Args, NexusConfig};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("nexus_proxy=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    let config = Arc::new(NexusConfig::from_args(&args));

    info!(addr = %args.addr, worker_enabled = config.ai_worker_enabled, "starting claude-nexus-proxy");

    let storage = Storage::connect(&args.database_url).await?;
    let credentials = Arc::new(CredentialStore::new(
        args.credentials_dir.clone(),
        args.oauth_refresh_url.clone(),
    ));
    let http = reqwest::Client::new();
    let shutting_down = Arc::new(AtomicBool::new(false));

    let (shutdown_tx, shutdown_rx) = shutdown::watch_channel();

    let state = AppState {
        storage: storage.clone(),
        credentials,
        http,
        config: config.clone(),
        worker_enabled: config.ai_worker_enabled,
        shutting_down: shutting_down.clone(),
    };

    let worker_handle = spawn_worker_if_enabled(&config, storage, shutdown_rx);

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&args.addr).await?;

    let shutdown_signal = async move {
        shutdown::signal().await;
        shutting_down.store(true, std::sync::atomic::Ordering::Relaxed);
        let _ = shutdown_tx.send(true);
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "analysis worker task panicked");
        }
    }

    Ok(())
}

fn spawn_worker_if_enabled(
    config: &Arc<NexusConfig>,
    storage: Storage,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.ai_worker_enabled {
        info!("analysis worker disabled (AI_WORKER_ENABLED=false)");
        return None;
    }

    let Some(api_key) = config.gemini_api_key.clone() else {
        warn!("AI_WORKER_ENABLED is set but GEMINI_API_KEY is missing; worker will not start");
        return None;
    };

    let store: Arc<dyn AnalysisStore> = Arc::new(storage);
    let llm: Arc<dyn AnalysisLlm> = Arc::new(GeminiClient::new(
        api_key,
        config.gemini_model_name.clone(),
        config.upstream_request_timeout,
    ));

    let worker_config = WorkerConfig {
        poll_interval: config.ai_worker_poll_interval,
        max_concurrent_jobs: config.ai_worker_max_concurrent_jobs,
        job_timeout: config.ai_worker_job_timeout,
        max_retries: config.ai_analysis_max_retries,
        request_timeout: config.upstream_request_timeout,
        max_context_tokens: config.ai_analysis_max_context_tokens,
        truncation: config.truncation.clone(),
    };

    Some(tokio::spawn(async move {
        nexus_analysis::run(store, llm, worker_config, shutdown_rx).await;
    }))
}
