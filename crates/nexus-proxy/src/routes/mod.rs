mod analyses;
mod health;
mod messages;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages::messages))
        .route("/health", get(health::health))
        .route("/status", get(health::status))
        .route(
            "/api/analyses/:conversation_id/:branch_id",
            get(analyses::get_analysis),
        )
        .route(
            "/api/analyses/:conversation_id/:branch_id/regenerate",
            post(analyses::regenerate),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
