//! System Sampler handlers (spec §4.7 "System").

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::AppState;
use crate::errors::{AppError, AppResult};
use crate::system::{LiveSnapshot, SystemSample};

pub async fn live(State(state): State<AppState>) -> Json<LiveSnapshot> {
    Json(state.system.live_snapshot().await)
}

#[derive(Deserialize)]
pub struct HistoricalQuery {
    since: DateTime<Utc>,
}

pub async fn historical(State(state): State<AppState>, Query(q): Query<HistoricalQuery>) -> AppResult<Json<Vec<SystemSample>>> {
    let samples = state.system.historical(q.since).await.map_err(|e| AppError::Store(e.to_string()))?;
    Ok(Json(samples))
}
