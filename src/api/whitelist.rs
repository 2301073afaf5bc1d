//! Whitelist resource handlers (spec §4.7 "Whitelist", §4.4).

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::auth::AuthenticatedUser;
use crate::errors::{AppError, AppResult};
use crate::whitelist::{WhitelistEntry, WhitelistKind};

pub async fn list(State(state): State<AppState>) -> Json<Vec<WhitelistEntry>> {
    Json(state.whitelist.list().await)
}

#[derive(Deserialize)]
pub struct SearchQuery {
    q: String,
}

pub async fn search(State(state): State<AppState>, Query(q): Query<SearchQuery>) -> Json<Vec<WhitelistEntry>> {
    Json(state.whitelist.search(&q.q).await)
}

pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"success": true, "counts": state.whitelist.stats().await}))
}

pub async fn metadata(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"success": true, "metadata": state.whitelist.metadata().await}))
}

#[derive(Deserialize)]
pub struct AddRequest {
    #[serde(rename = "type")]
    kind: WhitelistKind,
    value: String,
    #[serde(default)]
    description: String,
}

pub async fn add(State(state): State<AppState>, _user: AuthenticatedUser, Json(req): Json<AddRequest>) -> AppResult<Json<WhitelistEntry>> {
    let entry = state.whitelist.add(req.kind, req.value, req.description).await?;
    Ok(Json(entry))
}

pub async fn remove(State(state): State<AppState>, _user: AuthenticatedUser, Path(id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    state.whitelist.remove(&id).await.map_err(|e| match e {
        AppError::NotFound(_) => AppError::NotFound(format!("whitelist entry {id}")),
        other => other,
    })?;
    Ok(Json(json!({"success": true})))
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    value: Option<String>,
    description: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateRequest>,
) -> AppResult<Json<WhitelistEntry>> {
    let entry = state.whitelist.update(&id, req.value, req.description).await?;
    Ok(Json(entry))
}
