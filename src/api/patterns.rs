//! Pattern resource handlers (spec §4.7 "Patterns", §4.2).

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::auth::AuthenticatedUser;
use crate::errors::AppResult;
use crate::patterns::{PatternEntry, PatternKind};

#[derive(Serialize)]
pub struct PatternDto {
    id: String,
    #[serde(rename = "type")]
    kind: PatternKind,
    pattern: String,
    description: String,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

impl From<PatternEntry> for PatternDto {
    fn from(e: PatternEntry) -> Self {
        Self {
            id: e.id,
            kind: e.kind,
            pattern: e.source_string,
            description: e.description,
            created_at: e.created_at,
        }
    }
}

fn parse_kind(kind: &str) -> AppResult<PatternKind> {
    match kind {
        "ua" => Ok(PatternKind::Ua),
        "url" => Ok(PatternKind::Url),
        "ua_dangerous" => Ok(PatternKind::UaDangerous),
        "url_dangerous" => Ok(PatternKind::UrlDangerous),
        other => Err(crate::errors::AppError::validation(format!("unknown pattern kind: {other}"))),
    }
}

pub async fn list(State(state): State<AppState>, Path(kind): Path<String>) -> AppResult<Json<Vec<PatternDto>>> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.patterns.list(kind).await.into_iter().map(PatternDto::from).collect()))
}

pub async fn list_all(State(state): State<AppState>) -> Json<Vec<PatternDto>> {
    Json(state.patterns.list_all().await.into_iter().map(PatternDto::from).collect())
}

pub async fn stats(State(state): State<AppState>, Path(kind): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let kind = parse_kind(&kind)?;
    let count = state.patterns.list(kind).await.len();
    let validity_ratio = state.patterns.validity_ratio(kind).await;
    Ok(Json(json!({"success": true, "count": count, "validity_ratio": validity_ratio})))
}

#[derive(Deserialize)]
pub struct AddRequest {
    pattern: String,
    #[serde(default)]
    description: String,
}

pub async fn add(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path(kind): Path<String>,
    Json(req): Json<AddRequest>,
) -> AppResult<Json<PatternDto>> {
    let kind = parse_kind(&kind)?;
    let entry = state.patterns.add(kind, req.pattern, req.description).await?;
    Ok(Json(entry.into()))
}

pub async fn remove(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path((kind, id)): Path<(String, String)>,
) -> AppResult<Json<serde_json::Value>> {
    let kind = parse_kind(&kind)?;
    state.patterns.remove(kind, &id).await?;
    Ok(Json(json!({"success": true})))
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    pattern: Option<String>,
    description: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Path((kind, id)): Path<(String, String)>,
    Json(req): Json<UpdateRequest>,
) -> AppResult<Json<PatternDto>> {
    let kind = parse_kind(&kind)?;
    let entry = state.patterns.update(kind, &id, req.pattern, req.description).await?;
    Ok(Json(entry.into()))
}
