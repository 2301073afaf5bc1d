//! Service Supervisor handlers (spec §4.7 "Services", §4.9).

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::auth::AuthenticatedUser;
use crate::errors::{AppError, AppResult};
use crate::supervisor::RestartSentinel;

pub async fn request_restart(State(state): State<AppState>, _user: AuthenticatedUser, Path(service): Path<String>) -> AppResult<Json<serde_json::Value>> {
    state.supervisor.request_restart(&service).await.map_err(|e| AppError::validation(e.to_string()))?;
    Ok(Json(json!({"success": true})))
}

pub async fn restart_status(State(state): State<AppState>, Path(service): Path<String>) -> AppResult<Json<RestartSentinel>> {
    let sentinel = state.supervisor.restart_status(&service).await.map_err(|e| AppError::validation(e.to_string()))?;
    Ok(Json(sentinel))
}

pub async fn pending_restarts(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"success": true, "pending": state.supervisor.all_pending_restarts().await}))
}
