use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Liveness; stays 200 through shutdown, unlike `/_hub/healthz`.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut hubs = state.supervisor.hub_names();
    hubs.sort();
    Json(serde_json::json!({ "status": "ok", "hubs": hubs }))
}
