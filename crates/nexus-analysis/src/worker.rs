use std::sync::Arc;
use std::time::Duration;

use nexus_truncate::{Tokenizer, TruncationConfig};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AnalysisError;
use crate::llm::AnalysisLlm;
use crate::parse::extract_json;
use crate::prompt::build_prompt;
use crate::store::AnalysisStore;

/// Tunables enumerated in spec §4.7 / §6. Every field has a default drawn
/// from the spec's own defaults (or, where absent from source, the
/// implementation choice recorded in `SPEC_FULL.md` / `DESIGN.md`).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub job_timeout: Duration,
    pub max_retries: i32,
    pub request_timeout: Duration,
    pub max_context_tokens: usize,
    pub truncation: TruncationConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            max_concurrent_jobs: 3,
            // Absent from source; spec §9c resolves this as a safe multiple
            // of the poll interval and LLM request timeout.
            job_timeout: Duration::from_secs(600),
            max_retries: 3,
            request_timeout: Duration::from_secs(120),
            max_context_tokens: 100_000,
            truncation: TruncationConfig::default(),
        }
    }
}

/// Runs the poll loop until `shutdown` is signalled (spec §4.7, §5).
/// Each tick leases as many `pending` rows as there are free concurrency
/// slots and processes them as independent tasks; a lease that comes back
/// empty ends the tick early rather than spinning.
pub async fn run(
    store: Arc<dyn AnalysisStore>,
    llm: Arc<dyn AnalysisLlm>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let tokenizer = Arc::new(Tokenizer::new());
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "analysis worker started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                poll_once(&store, &llm, &tokenizer, &config, &semaphore, &shutdown).await;
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("analysis worker shutting down");
                    break;
                }
            }
        }
    }
}

async fn poll_once(
    store: &Arc<dyn AnalysisStore>,
    llm: &Arc<dyn AnalysisLlm>,
    tokenizer: &Arc<Tokenizer>,
    config: &WorkerConfig,
    semaphore: &Arc<Semaphore>,
    shutdown: &watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            return;
        };

        let job = match store.lease_next(config.max_retries).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                drop(permit);
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to lease next analysis");
                drop(permit);
                return;
            }
        };

        let store = store.clone();
        let llm = llm.clone();
        let tokenizer = tokenizer.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let _permit = permit;
            process_job(store, llm, tokenizer, config, job.id, job.conversation_id, job.branch_id, shutdown).await;
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_job(
    store: Arc<dyn AnalysisStore>,
    llm: Arc<dyn AnalysisLlm>,
    tokenizer: Arc<Tokenizer>,
    config: WorkerConfig,
    id: Uuid,
    conversation_id: Uuid,
    branch_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let work = run_job(&store, &llm, &tokenizer, &config, conversation_id, &branch_id);

    let outcome = tokio::select! {
        result = tokio::time::timeout(config.job_timeout, work) => Some(result),
        _ = wait_for_shutdown(&mut shutdown) => None,
    };

    match outcome {
        None => {
            // Shutdown requested mid-flight: release the lease without
            // penalizing the job's retry budget (spec §4.7, §5).
            if let Err(e) = store.revert_for_shutdown(id).await {
                warn!(analysis_id = %id, error = %e, "failed to revert analysis on shutdown");
            }
        }
        Some(Err(_elapsed)) => {
            warn!(analysis_id = %id, "analysis job timed out");
            if let Err(e) = store.retry(id, "job timed out").await {
                error!(analysis_id = %id, error = %e, "failed to record job timeout");
            }
        }
        Some(Ok(Ok(result))) => {
            debug!(analysis_id = %id, "analysis completed");
            if let Err(e) = store
                .complete(
                    id,
                    &result.analysis_content,
                    &result.analysis_data,
                    &result.raw_response,
                    result.prompt_tokens,
                    result.completion_tokens,
                )
                .await
            {
                error!(analysis_id = %id, error = %e, "failed to store completed analysis");
            }
        }
        Some(Ok(Err(e))) => {
            warn!(analysis_id = %id, error = %e, "analysis job failed");
            if let Err(store_err) = store.retry(id, &e.to_string()).await {
                error!(analysis_id = %id, error = %store_err, "failed to record analysis failure");
            }
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct JobResult {
    analysis_content: String,
    analysis_data: serde_json::Value,
    raw_response: serde_json::Value,
    prompt_tokens: i32,
    completion_tokens: i32,
}

/// Steps 3-6 of spec §4.7: assemble the transcript, truncate it, call the
/// LLM, and parse its reply.
async fn run_job(
    store: &Arc<dyn AnalysisStore>,
    llm: &Arc<dyn AnalysisLlm>,
    tokenizer: &Tokenizer,
    config: &WorkerConfig,
    conversation_id: Uuid,
    branch_id: &str,
) -> Result<JobResult, AnalysisError> {
    let requests = store
        .list_conversation_requests(conversation_id, branch_id)
        .await?;

    let prompt = build_prompt(tokenizer, &requests, config.max_context_tokens, &config.truncation);
    let response = llm.generate(&prompt).await?;
    let analysis_data = extract_json(&response.raw_text)?;

    Ok(JobResult {
        analysis_content: response.raw_text.clone(),
        analysis_data,
        raw_response: serde_json::json!({ "text": response.raw_text }),
        prompt_tokens: response.prompt_tokens,
        completion_tokens: response.completion_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nexus_types::request::{AnalysisStatus, ConversationAnalysis, Request, RequestType, Usage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeStore {
        pending: Mutex<Vec<ConversationAnalysis>>,
        requests: Mutex<Vec<Request>>,
        leases: AtomicUsize,
        completed: Mutex<Vec<Uuid>>,
        retried: Mutex<Vec<(Uuid, String)>>,
        reverted: Mutex<Vec<Uuid>>,
    }

    impl FakeStore {
        fn new(pending: Vec<ConversationAnalysis>, requests: Vec<Request>) -> Self {
            Self {
                pending: Mutex::new(pending),
                requests: Mutex::new(requests),
                leases: AtomicUsize::new(0),
                completed: Mutex::new(Vec::new()),
                retried: Mutex::new(Vec::new()),
                reverted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AnalysisStore for FakeStore {
        async fn lease_next(&self, _max_retries: i32) -> Result<Option<ConversationAnalysis>, AnalysisError> {
            self.leases.fetch_add(1, Ordering::SeqCst);
            Ok(self.pending.lock().unwrap().pop())
        }

        async fn list_conversation_requests(
            &self,
            conversation_id: Uuid,
            branch_id: &str,
        ) -> Result<Vec<Request>, AnalysisError> {
            Ok(self
                .requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.conversation_id == Some(conversation_id) && r.branch_id == branch_id)
                .cloned()
                .collect())
        }

        async fn complete(
            &self,
            id: Uuid,
            _analysis_content: &str,
            _analysis_data: &serde_json::Value,
            _raw_response: &serde_json::Value,
            _prompt_tokens: i32,
            _completion_tokens: i32,
        ) -> Result<(), AnalysisError> {
            self.completed.lock().unwrap().push(id);
            Ok(())
        }

        async fn retry(&self, id: Uuid, error_message: &str) -> Result<(), AnalysisError> {
            self.retried.lock().unwrap().push((id, error_message.to_string()));
            Ok(())
        }

        async fn revert_for_shutdown(&self, id: Uuid) -> Result<(), AnalysisError> {
            self.reverted.lock().unwrap().push(id);
            Ok(())
        }
    }

    struct FixedLlm {
        reply: String,
    }

    #[async_trait]
    impl AnalysisLlm for FixedLlm {
        async fn generate(&self, _prompt: &str) -> Result<crate::llm::LlmResponse, AnalysisError> {
            Ok(crate::llm::LlmResponse {
                raw_text: self.reply.clone(),
                prompt_tokens: 10,
                completion_tokens: 5,
            })
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl AnalysisLlm for FailingLlm {
        async fn generate(&self, _prompt: &str) -> Result<crate::llm::LlmResponse, AnalysisError> {
            Err(AnalysisError::LlmCallFailed("upstream down".to_string()))
        }
    }

    fn analysis(conversation_id: Uuid, branch_id: &str) -> ConversationAnalysis {
        ConversationAnalysis {
            id: Uuid::new_v4(),
            conversation_id,
            branch_id: branch_id.to_string(),
            status: AnalysisStatus::Pending,
            retry_count: 0,
            error_message: None,
            analysis_content: None,
            analysis_data: None,
            raw_response: None,
            prompt_tokens: None,
            completion_tokens: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    fn request(conversation_id: Uuid, branch_id: &str) -> Request {
        Request {
            request_id: Uuid::new_v4(),
            domain: "example.com".to_string(),
            timestamp: chrono::Utc::now(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            headers: serde_json::json!({}),
            body: serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}),
            response_body: Some(serde_json::json!({"content": [{"type": "text", "text": "hello"}]})),
            response_streaming: false,
            model: Some("claude-3-7-sonnet".to_string()),
            request_type: RequestType::Inference,
            message_count: 1,
            current_message_hash: None,
            parent_message_hash: None,
            system_hash: None,
            conversation_id: Some(conversation_id),
            branch_id: branch_id.to_string(),
            parent_request_id: None,
            parent_task_request_id: None,
            is_subtask: false,
            usage: Usage::default(),
            first_token_ms: None,
            duration_ms: None,
            error: None,
            task_tool_invocation: Vec::new(),
            account_id: None,
            api_key_hash: None,
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_secs(5),
            max_retries: 3,
            request_timeout: Duration::from_secs(5),
            max_context_tokens: 10_000,
            truncation: TruncationConfig::default(),
        }
    }

    #[tokio::test]
    async fn successful_job_completes_and_stores_parsed_data() {
        let conversation_id = Uuid::new_v4();
        let job = analysis(conversation_id, "main");
        let id = job.id;
        let store = Arc::new(FakeStore::new(vec![job], vec![request(conversation_id, "main")]));
        let llm = Arc::new(FixedLlm {
            reply: "{\"summary\":\"done\",\"topics\":[],\"outcome\":\"completed\"}".to_string(),
        });
        let (_tx, rx) = watch::channel(false);

        let tokenizer = Arc::new(Tokenizer::new());
        let config = test_config();
        poll_once(&(store.clone() as Arc<dyn AnalysisStore>), &(llm as Arc<dyn AnalysisLlm>), &tokenizer, &config, &Arc::new(Semaphore::new(2)), &rx).await;

        // Give the spawned task a beat to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.completed.lock().unwrap().as_slice(), &[id]);
        assert!(store.retried.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn llm_failure_retries_without_completing() {
        let conversation_id = Uuid::new_v4();
        let job = analysis(conversation_id, "main");
        let id = job.id;
        let store = Arc::new(FakeStore::new(vec![job], vec![request(conversation_id, "main")]));
        let llm = Arc::new(FailingLlm);
        let (_tx, rx) = watch::channel(false);

        let tokenizer = Arc::new(Tokenizer::new());
        let config = test_config();
        poll_once(&(store.clone() as Arc<dyn AnalysisStore>), &(llm as Arc<dyn AnalysisLlm>), &tokenizer, &config, &Arc::new(Semaphore::new(2)), &rx).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.completed.lock().unwrap().is_empty());
        let retried = store.retried.lock().unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].0, id);
    }

    #[tokio::test]
    async fn empty_queue_leases_once_and_stops() {
        let store = Arc::new(FakeStore::new(Vec::new(), Vec::new()));
        let llm = Arc::new(FixedLlm { reply: "{}".to_string() });
        let (_tx, rx) = watch::channel(false);
        let tokenizer = Arc::new(Tokenizer::new());
        let config = test_config();

        poll_once(&(store.clone() as Arc<dyn AnalysisStore>), &(llm as Arc<dyn AnalysisLlm>), &tokenizer, &config, &Arc::new(Semaphore::new(2)), &rx).await;

        assert_eq!(store.leases.load(Ordering::SeqCst), 1);
    }
}
