use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use nexus_credentials::CredentialError;
use nexus_linker::{LinkInput, QueryExecutor};
use nexus_types::credential::Credential;
use nexus_types::request::{RequestType, StreamingChunk, Usage};
use nexus_types::Request as StoredRequest;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::auth::{authenticate_client, request_domain};
use crate::classify::classify;
use crate::error::ProxyError;
use crate::state::AppState;

/// `POST /v1/messages` and `POST /v1/messages?beta=...` (spec §4.5, §6).
/// Authenticates, classifies, resolves the domain's credential, forwards
/// upstream (streaming or buffered), and hands the assembled request to
/// storage once both sides of the pipe have closed.
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let domain = request_domain(&headers).ok_or(ProxyError::AuthFailed)?;
    authenticate_client(&headers, &domain, &state.credentials).await?;

    let body_json: Value = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

    let request_id = Uuid::new_v4();
    let timestamp = Utc::now();
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/v1/messages").to_string();
    let request_type = classify(&path, &body_json);
    let stream_requested = body_json.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let credential = state
        .credentials
        .lookup(&domain)
        .await
        .map_err(|_| ProxyError::AuthFailed)?;
    let token = state
        .credentials
        .ensure_fresh(&domain)
        .await
        .map_err(credential_error_to_proxy_error)?;

    let upstream_url = format!("{}{}", state.config.anthropic_base_url, path);
    let mut upstream = state
        .http
        .post(&upstream_url)
        .header("anthropic-version", &state.config.anthropic_version)
        .header("content-type", "application/json")
        .timeout(state.config.upstream_request_timeout)
        .body(body.clone());
    upstream = apply_credential_header(upstream, &credential, &token);

    let started_at = nexus_capture::now();
    let upstream_response = upstream
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;

    let status = upstream_response.status();

    if !status.is_success() {
        let upstream_status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let error_bytes = upstream_response.bytes().await.unwrap_or_default();

        let mut capture = nexus_capture::capture_buffered(
            &serde_json::from_slice(&error_bytes).unwrap_or(Value::Null),
            started_at,
        );
        capture.error = Some(format!("upstream rejected with status {}", status.as_u16()));

        let persist_ctx = PersistContext {
            request_id,
            domain: domain.clone(),
            timestamp,
            path: path.clone(),
            headers_json: headers_to_json(&headers),
            body: body_json.clone(),
            request_type,
            response_streaming: false,
        };
        persist(&state, persist_ctx, capture).await;

        return Ok((upstream_status, error_bytes).into_response());
    }

    if stream_requested {
        let (tx, rx) = mpsc::unbounded_channel();
        let byte_stream = upstream_response.bytes_stream();
        let shadow = nexus_capture::ShadowStream::new(byte_stream, tx);

        let persist_state = state.clone();
        let persist_ctx = PersistContext {
            request_id,
            domain: domain.clone(),
            timestamp,
            path: path.clone(),
            headers_json: headers_to_json(&headers),
            body: body_json.clone(),
            request_type,
            response_streaming: true,
        };
        tokio::spawn(async move {
            let capture = nexus_capture::capture_stream(rx, started_at).await;
            persist(&persist_state, persist_ctx, capture).await;
        });

        let response = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(shadow))
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
        return Ok(response);
    }

    let response_bytes = upstream_response
        .bytes()
        .await
        .map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
    let response_json: Value = serde_json::from_slice(&response_bytes)
        .map_err(|e| ProxyError::Internal(format!("upstream returned non-JSON body: {e}")))?;

    let capture = nexus_capture::capture_buffered(&response_json, started_at);
    let persist_ctx = PersistContext {
        request_id,
        domain: domain.clone(),
        timestamp,
        path: path.clone(),
        headers_json: headers_to_json(&headers),
        body: body_json.clone(),
        request_type,
        response_streaming: false,
    };
    let response_body = capture.response_body.clone();
    persist(&state, persist_ctx, capture).await;

    Ok((StatusCode::OK, axum::Json(response_body)).into_response())
}

fn credential_error_to_proxy_error(err: CredentialError) -> ProxyError {
    match err {
        CredentialError::NotFound(_) | CredentialError::Malformed(_, _) => ProxyError::AuthFailed,
        CredentialError::NoRefreshToken(domain) => {
            ProxyError::RefreshFailed(format!("no refresh token on file for {domain}"))
        }
        CredentialError::RefreshRejected(domain, reason) => {
            ProxyError::RefreshFailed(format!("upstream rejected refresh for {domain}: {reason}"))
        }
        CredentialError::WriteFailed(_, reason) => ProxyError::RefreshFailed(reason),
        CredentialError::Io(reason) => ProxyError::RefreshFailed(reason),
    }
}

/// `ApiKey` credentials authenticate with Anthropic's `x-api-key` header;
/// `OAuth` credentials (the Claude-subscription login flow) authenticate
/// as a bearer token instead (implementation choice, recorded in
/// `DESIGN.md`).
fn apply_credential_header(
    builder: reqwest::RequestBuilder,
    credential: &Credential,
    token: &str,
) -> reqwest::RequestBuilder {
    match credential {
        Credential::ApiKey { .. } => builder.header("x-api-key", token),
        Credential::OAuth { .. } => builder.header("authorization", format!("Bearer {token}")),
    }
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let map: serde_json::Map<String, Value> = headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()) && name.as_str() != "authorization")
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
        })
        .collect();
    Value::Object(map)
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailer"
            | "transfer-encoding" | "upgrade" | "host"
    )
}

struct PersistContext {
    request_id: Uuid,
    domain: String,
    timestamp: chrono::DateTime<Utc>,
    path: String,
    headers_json: Value,
    body: Value,
    request_type: RequestType,
    response_streaming: bool,
}

/// Computes hashes, runs the linker when applicable, and writes the
/// completed request (spec §4.4). Failures here are logged and never
/// propagate — the client has already been served (spec §7 propagation
/// policy).
async fn persist(state: &AppState, ctx: PersistContext, capture: nexus_capture::CaptureResult) {
    let messages = ctx.body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
    let system = ctx.body.get("system").cloned();
    let message_count = messages.len() as i32;

    let (
        conversation_id,
        branch_id,
        parent_request_id,
        is_subtask,
        parent_task_request_id,
        current_message_hash,
        parent_message_hash,
        system_hash,
    ) = if ctx.request_type.participates_in_linking() {
        let input = LinkInput {
            domain: &ctx.domain,
            messages: &messages,
            system: system.as_ref(),
            now: ctx.timestamp,
        };
        match nexus_linker::link(input, &state.storage).await {
            Ok(linkage) => (
                Some(linkage.conversation_id),
                linkage.branch_id,
                linkage.parent_request_id,
                linkage.is_subtask,
                linkage.parent_task_request_id,
                Some(linkage.current_message_hash),
                linkage.parent_message_hash,
                linkage.system_hash,
            ),
            Err(e) => {
                // Linking errors degrade to "treat as conversation root"
                // rather than failing the write (spec §7).
                warn!(request_id = %ctx.request_id, error = %e, "linking failed, treating as conversation root");
                let current_message_hash = nexus_hash::hash_messages_only(&messages);
                let parent_message_hash = nexus_hash::parent_hash(&messages);
                let system_hash = nexus_hash::hash_system_prompt(system.as_ref());
                (
                    None,
                    "main".to_string(),
                    None,
                    false,
                    None,
                    Some(current_message_hash),
                    parent_message_hash,
                    system_hash,
                )
            }
        }
    } else {
        // `query_evaluation` (and other non-inference types) still get
        // hashes computed, but are never linked into a conversation
        // (SPEC_FULL §2, spec §9b).
        let current_message_hash = if messages.is_empty() {
            None
        } else {
            Some(nexus_hash::hash_messages_only(&messages))
        };
        let parent_message_hash = nexus_hash::parent_hash(&messages);
        let system_hash = nexus_hash::hash_system_prompt(system.as_ref());
        (None, "main".to_string(), None, false, None, current_message_hash, parent_message_hash, system_hash)
    };

    let chunks: Vec<StreamingChunk> = capture
        .raw_chunks
        .iter()
        .enumerate()
        .map(|(i, data)| StreamingChunk {
            request_id: ctx.request_id,
            chunk_index: i as i32,
            timestamp: Utc::now(),
            data: data.clone(),
            token_count: None,
        })
        .collect();

    let request = StoredRequest {
        request_id: ctx.request_id,
        domain: ctx.domain.clone(),
        timestamp: ctx.timestamp,
        method: "POST".to_string(),
        path: ctx.path,
        headers: ctx.headers_json,
        body: ctx.body,
        response_body: Some(capture.response_body),
        response_streaming: ctx.response_streaming,
        model: capture.model,
        request_type: ctx.request_type,
        message_count,
        current_message_hash,
        parent_message_hash,
        system_hash,
        conversation_id,
        branch_id,
        parent_request_id,
        parent_task_request_id,
        is_subtask,
        usage: capture.usage,
        first_token_ms: capture.first_token_ms,
        duration_ms: Some(capture.duration_ms),
        error: capture.error,
        task_tool_invocation: capture.task_invocations,
        account_id: None,
        api_key_hash: None,
    };

    if let Err(e) = state.storage.persist_request(&request, &chunks).await {
        error!(request_id = %ctx.request_id, error = %e, "failed to persist request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("Host"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn credential_header_selects_on_variant() {
        let api_key = Credential::ApiKey { api_key: "sk-1".to_string(), client_api_key: None };
        let oauth = Credential::OAuth {
            oauth: nexus_types::credential::OAuthState {
                access_token: "at".to_string(),
                refresh_token: "rt".to_string(),
                expires_at: Utc::now(),
                scopes: vec![],
                is_max: false,
            },
            client_api_key: None,
        };

        let client = reqwest::Client::new();
        let req = apply_credential_header(client.post("http://unused.invalid"), &api_key, "sk-1")
            .build()
            .unwrap();
        assert!(req.headers().contains_key("x-api-key"));

        let req = apply_credential_header(client.post("http://unused.invalid"), &oauth, "at")
            .build()
            .unwrap();
        assert!(req.headers().contains_key("authorization"));
    }
}
