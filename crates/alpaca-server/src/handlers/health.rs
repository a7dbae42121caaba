//! Health check handler.

use axum::{extract::State, Json};

use crate::models::HealthResponse;
use crate::state::AppState;

/// Liveness plus a snapshot of the generation queue.
pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.queue.model_name().to_string(),
        queue: state.queue.stats(),
    })
}
