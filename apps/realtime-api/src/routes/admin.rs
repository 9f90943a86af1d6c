//! Admin surface over the supervisor: link listing, health probe, and kicks.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::hub::LinkInfo;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/_hub/links", get(links))
        .route("/_hub/healthz", get(healthz))
        .route("/_hub/kick", get(kick))
}

async fn links(State(state): State<AppState>) -> Json<Vec<LinkInfo>> {
    Json(state.supervisor.list_links())
}

/// 200 while the supervisor is healthy, 503 once shutdown has begun.
async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    if state.supervisor.healthy() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "shutting_down" })),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct KickParams {
    pub hub: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct KickResponse {
    pub kicked: usize,
}

async fn kick(
    State(state): State<AppState>,
    Query(params): Query<KickParams>,
) -> Result<Json<KickResponse>, ApiError> {
    if params.user_id.is_none() && params.session_id.is_none() {
        return Err(ApiError::bad_request("user_id or session_id is required"));
    }

    let kicked = state.supervisor.kick(
        params.hub.as_deref(),
        params.user_id.as_deref(),
        params.session_id.as_deref(),
    )?;
    tracing::info!(
        hub = ?params.hub,
        user_id = ?params.user_id,
        session_id = ?params.session_id,
        kicked,
        "admin kick"
    );
    Ok(Json(KickResponse { kicked }))
}
