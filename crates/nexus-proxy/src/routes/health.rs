use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// Liveness: the process is up and serving. Never checks dependencies.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness: the database is reachable and the process isn't mid-shutdown.
/// Used by deployment tooling to gate traffic, not by clients.
pub async fn status(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = sqlx_ping(&state).await;
    let shutting_down = state.shutting_down.load(Ordering::Relaxed);

    let healthy = db_ok && !shutting_down;
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(json!({
            "database": db_ok,
            "worker_enabled": state.worker_enabled,
            "shutting_down": shutting_down,
        })),
    )
}

async fn sqlx_ping(state: &AppState) -> bool {
    sqlx::query("SELECT 1").execute(state.storage.pool()).await.is_ok()
}
