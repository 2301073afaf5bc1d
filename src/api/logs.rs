//! Log-file inspection handlers (spec §4.7 "Logs"): list the files the
//! Log Pipeline discovers, tail them with limit/offset/search, and
//! report per-file stats. Reads directly off disk rather than off the
//! live pipeline channel, the same "glob the configured log_dir" idiom
//! `pipeline::discover_once` uses for tailing.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::errors::{AppError, AppResult};

#[derive(Serialize)]
struct LogFileInfo {
    path: String,
    size_bytes: u64,
    modified: Option<chrono::DateTime<chrono::Utc>>,
}

async fn discovered_files(state: &AppState) -> AppResult<Vec<String>> {
    let config = state.config.get().await;
    let pattern = format!("{}/**/*.log", config.log_dir.trim_end_matches('/'));
    let paths = glob::glob(&pattern).map_err(|e| AppError::validation(e.to_string()))?;
    Ok(paths.filter_map(Result::ok).map(|p| p.display().to_string()).collect())
}

pub async fn files(State(state): State<AppState>) -> AppResult<Json<Vec<LogFileInfo>>> {
    let mut out = Vec::new();
    for path in discovered_files(&state).await? {
        let metadata = tokio::fs::metadata(&path).await.ok();
        out.push(LogFileInfo {
            size_bytes: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            modified: metadata
                .and_then(|m| m.modified().ok())
                .map(chrono::DateTime::<chrono::Utc>::from),
            path,
        });
    }
    Ok(Json(out))
}

#[derive(Deserialize)]
pub struct TailQuery {
    file: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    search: Option<String>,
}

fn default_limit() -> usize {
    200
}

async fn read_lines(path: &str) -> AppResult<Vec<String>> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| AppError::NotFound(format!("{path}: {e}")))?;
    Ok(contents.lines().map(str::to_string).collect())
}

/// `limit`/`offset` count back from the end of the file (the most
/// recent lines first), matching a tail-style admin view.
pub async fn tail(State(_state): State<AppState>, Query(q): Query<TailQuery>) -> AppResult<Json<serde_json::Value>> {
    let mut lines = read_lines(&q.file).await?;
    if let Some(search) = &q.search {
        let needle = search.to_lowercase();
        lines.retain(|l| l.to_lowercase().contains(&needle));
    }
    let total = lines.len();
    lines.reverse();
    let page: Vec<String> = lines.into_iter().skip(q.offset).take(q.limit).collect();
    Ok(Json(json!({"success": true, "file": q.file, "total": total, "lines": page})))
}

#[derive(Deserialize)]
pub struct FileQuery {
    file: String,
}

pub async fn stats(State(_state): State<AppState>, Query(q): Query<FileQuery>) -> AppResult<Json<serde_json::Value>> {
    let metadata = tokio::fs::metadata(&q.file).await.map_err(|e| AppError::NotFound(format!("{}: {e}", q.file)))?;
    let lines = read_lines(&q.file).await?;
    Ok(Json(json!({
        "success": true,
        "file": q.file,
        "size_bytes": metadata.len(),
        "line_count": lines.len(),
    })))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    q: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

pub async fn search(State(state): State<AppState>, Query(q): Query<SearchQuery>) -> AppResult<Json<serde_json::Value>> {
    let needle = q.q.to_lowercase();
    let mut hits = Vec::new();
    for path in discovered_files(&state).await? {
        let Ok(lines) = read_lines(&path).await else { continue };
        for line in lines.into_iter().filter(|l| l.to_lowercase().contains(&needle)) {
            hits.push(json!({"file": path, "line": line}));
            if hits.len() >= q.limit {
                break;
            }
        }
        if hits.len() >= q.limit {
            break;
        }
    }
    Ok(Json(json!({"success": true, "matches": hits})))
}
