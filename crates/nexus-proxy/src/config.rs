use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use nexus_truncate::TruncationConfig;

/// CLI surface for the proxy binary. Every flag is overridable by the
/// environment variable enumerated in spec §6; `clap`'s `env` feature wires
/// that up directly rather than hand-rolling a second config pass.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0:3000", env = "PROXY_ADDR")]
    pub addr: String,

    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Directory holding `<domain>.credentials.json` files.
    #[arg(long, default_value = "./credentials", env = "CREDENTIALS_DIR")]
    pub credentials_dir: PathBuf,

    /// Shared key accepted on the `X-Dashboard-Key` header for management
    /// endpoints.
    #[arg(long, env = "DASHBOARD_API_KEY")]
    pub dashboard_api_key: Option<String>,

    /// Base URL of the upstream Anthropic Messages API.
    #[arg(long, default_value = "https://api.anthropic.com", env = "ANTHROPIC_BASE_URL")]
    pub anthropic_base_url: String,

    /// `anthropic-version` header value sent upstream.
    #[arg(long, default_value = "2023-06-01", env = "ANTHROPIC_VERSION")]
    pub anthropic_version: String,

    /// OAuth refresh endpoint used by the credential store.
    #[arg(long, default_value = "https://console.anthropic.com/v1/oauth/token", env = "OAUTH_REFRESH_URL")]
    pub oauth_refresh_url: String,

    /// Whether the background analysis worker runs in this process.
    #[arg(long, default_value_t = false, env = "AI_WORKER_ENABLED")]
    pub ai_worker_enabled: bool,

    #[arg(long, env = "GEMINI_API_KEY")]
    pub gemini_api_key: Option<String>,

    #[arg(long, default_value = "gemini-1.5-flash", env = "GEMINI_MODEL_NAME")]
    pub gemini_model_name: String,

    #[arg(long, default_value_t = 5000, env = "AI_WORKER_POLL_INTERVAL_MS")]
    pub ai_worker_poll_interval_ms: u64,

    #[arg(long, default_value_t = 3, env = "AI_WORKER_MAX_CONCURRENT_JOBS")]
    pub ai_worker_max_concurrent_jobs: usize,

    /// Absent from source (spec §9c); resolved as a safe multiple of the
    /// poll interval and LLM request timeout.
    #[arg(long, default_value_t = 10, env = "AI_WORKER_JOB_TIMEOUT_MINUTES")]
    pub ai_worker_job_timeout_minutes: u64,

    #[arg(long, default_value_t = 3, env = "AI_ANALYSIS_MAX_RETRIES")]
    pub ai_analysis_max_retries: i32,

    #[arg(long, default_value_t = 100_000, env = "AI_ANALYSIS_MAX_CONTEXT_TOKENS")]
    pub ai_analysis_max_context_tokens: usize,

    #[arg(long, default_value_t = 2, env = "TRUNCATION_HEAD_MESSAGES")]
    pub truncation_head_messages: usize,

    #[arg(long, default_value_t = 4, env = "TRUNCATION_TAIL_MESSAGES")]
    pub truncation_tail_messages: usize,

    #[arg(long, default_value_t = 200, env = "TRUNCATION_FIRST_N_TOKENS")]
    pub truncation_first_n_tokens: usize,

    #[arg(long, default_value_t = 200, env = "TRUNCATION_LAST_M_TOKENS")]
    pub truncation_last_m_tokens: usize,

    /// Per-request deadline for the upstream call (spec §5 "bounded by a
    /// per-request deadline (default 5 min)").
    #[arg(long, default_value_t = 300, env = "UPSTREAM_REQUEST_TIMEOUT_SECS")]
    pub upstream_request_timeout_secs: u64,
}

/// Resolved, process-wide configuration built once at startup and shared
/// via `Arc` across request handlers and the analysis worker.
pub struct NexusConfig {
    pub anthropic_base_url: String,
    pub anthropic_version: String,
    pub dashboard_api_key: Option<String>,
    pub ai_worker_enabled: bool,
    pub gemini_api_key: Option<String>,
    pub gemini_model_name: String,
    pub ai_worker_poll_interval: Duration,
    pub ai_worker_max_concurrent_jobs: usize,
    pub ai_worker_job_timeout: Duration,
    pub ai_analysis_max_retries: i32,
    pub ai_analysis_max_context_tokens: usize,
    pub truncation: TruncationConfig,
    pub upstream_request_timeout: Duration,
}

impl NexusConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            anthropic_base_url: args.anthropic_base_url.clone(),
            anthropic_version: args.anthropic_version.clone(),
            dashboard_api_key: args.dashboard_api_key.clone(),
            ai_worker_enabled: args.ai_worker_enabled,
            gemini_api_key: args.gemini_api_key.clone(),
            gemini_model_name: args.gemini_model_name.clone(),
            ai_worker_poll_interval: Duration::from_millis(args.ai_worker_poll_interval_ms),
            ai_worker_max_concurrent_jobs: args.ai_worker_max_concurrent_jobs,
            ai_worker_job_timeout: Duration::from_secs(args.ai_worker_job_timeout_minutes * 60),
            ai_analysis_max_retries: args.ai_analysis_max_retries,
            ai_analysis_max_context_tokens: args.ai_analysis_max_context_tokens,
            truncation: TruncationConfig {
                head_messages: args.truncation_head_messages,
                tail_messages: args.truncation_tail_messages,
                truncate_first_n_tokens: args.truncation_first_n_tokens,
                truncate_last_m_tokens: args.truncation_last_m_tokens,
            },
            upstream_request_timeout: Duration::from_secs(args.upstream_request_timeout_secs),
        }
    }
}
