use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::authenticate_dashboard;
use crate::error::ProxyError;
use crate::state::AppState;

/// `POST /api/analyses/:conversation_id/:branch_id/regenerate` — the
/// narrow management surface SPEC_FULL §2 adds so the "a new pending row
/// supersedes any failed prior one" lifecycle (spec §7) is reachable
/// without building a dashboard UI. Marks any existing non-failed row
/// failed, then enqueues a fresh `pending` one.
pub async fn regenerate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, branch_id)): Path<(Uuid, String)>,
) -> Result<Json<Value>, ProxyError> {
    authenticate_dashboard(&headers, state.config.dashboard_api_key.as_deref())?;

    state
        .storage
        .mark_analysis_failed(conversation_id, &branch_id)
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    let id = state
        .storage
        .enqueue_analysis(conversation_id, &branch_id)
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    Ok(Json(json!({ "id": id, "status": "pending" })))
}

/// `GET /api/analyses/:conversation_id/:branch_id` — reads back the
/// current (non-failed) analysis for a branch, if any.
pub async fn get_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, branch_id)): Path<(Uuid, String)>,
) -> Result<Json<Value>, ProxyError> {
    authenticate_dashboard(&headers, state.config.dashboard_api_key.as_deref())?;

    let analysis = state
        .storage
        .find_analysis(conversation_id, &branch_id)
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?
        .ok_or(ProxyError::AnalysisNotFound)?;

    Ok(Json(serde_json::to_value(analysis).map_err(|e| ProxyError::Internal(e.to_string()))?))
}
