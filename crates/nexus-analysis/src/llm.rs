use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AnalysisError, AnalysisResult};

/// An LLM's reply to a single analysis prompt, plus whatever token-usage
/// accounting it reported.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub raw_text: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

/// The external summarization call (spec §4.7 step 5). A trait so the
/// worker loop is testable against a canned responder instead of a live
/// Gemini endpoint.
#[async_trait]
pub trait AnalysisLlm: Send + Sync {
    async fn generate(&self, prompt: &str) -> AnalysisResult<LlmResponse>;
}

/// Calls the Gemini `generateContent` REST endpoint. Configured from
/// `GEMINI_API_KEY` / `GEMINI_MODEL_NAME` (spec §6).
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, request_timeout: Duration) -> Self {
        Self::with_base_url(
            "https://generativelanguage.googleapis.com",
            api_key,
            model,
            request_timeout,
        )
    }

    /// Exposed separately so tests can point the client at a `wiremock`
    /// server instead of the real Gemini host.
    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: i32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: i32,
}

#[async_trait]
impl AnalysisLlm for GeminiClient {
    async fn generate(&self, prompt: &str) -> AnalysisResult<LlmResponse> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let body = GenerateRequest {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![GeminiPart { text: prompt.to_string() }],
            }],
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalysisError::LlmCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AnalysisError::LlmCallFailed(format!(
                "gemini returned {status}: {text}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::LlmCallFailed(e.to_string()))?;

        let raw_text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| AnalysisError::LlmCallFailed("empty response from gemini".to_string()))?;

        let usage = parsed.usage_metadata.unwrap_or_default();

        Ok(LlmResponse {
            raw_text,
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn generate_extracts_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1beta/models/.*:generateContent$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "{\"summary\":\"ok\"}"}]}}],
                "usageMetadata": {"promptTokenCount": 42, "candidatesTokenCount": 7}
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(server.uri(), "key", "gemini-1.5-flash", Duration::from_secs(5));
        let response = client.generate("hello").await.unwrap();
        assert_eq!(response.raw_text, "{\"summary\":\"ok\"}");
        assert_eq!(response.prompt_tokens, 42);
        assert_eq!(response.completion_tokens, 7);
    }

    #[tokio::test]
    async fn non_success_status_is_an_llm_call_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1beta/models/.*:generateContent$"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(server.uri(), "key", "gemini-1.5-flash", Duration::from_secs(5));
        let err = client.generate("hello").await.unwrap_err();
        assert!(matches!(err, AnalysisError::LlmCallFailed(_)));
    }
}
