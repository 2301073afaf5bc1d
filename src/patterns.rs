//! Pattern Registry & Dangerous Detector (spec §4.2).
//!
//! Four pattern files (classify-UA, classify-URL, dangerous-UA,
//! dangerous-URL) of one-JSON-object-per-line entries. Writers always
//! write-temp + rename; invalid regex entries are skipped with a warning
//! and counted against the file's validity ratio.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Ua,
    Url,
    UaDangerous,
    UrlDangerous,
}

impl PatternKind {
    fn filename(self) -> &'static str {
        match self {
            PatternKind::Ua => "classify_ua.pattern",
            PatternKind::Url => "classify_url.pattern",
            PatternKind::UaDangerous => "ua.dangerous",
            PatternKind::UrlDangerous => "url.dangerous",
        }
    }

    pub const ALL: [PatternKind; 4] = [
        PatternKind::Ua,
        PatternKind::Url,
        PatternKind::UaDangerous,
        PatternKind::UrlDangerous,
    ];
}

/// One line of a pattern file, JSON-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: String,
    pub pattern: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: PatternKind,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Legacy on-disk shape (`pattern = description`), accepted on read.
#[derive(Debug, Deserialize)]
struct LegacyPatternLine {
    pattern: String,
}

#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub id: String,
    pub kind: PatternKind,
    pub regex: Option<Arc<Regex>>,
    pub source_string: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

struct FileState {
    entries: Vec<PatternEntry>,
    invalid_count: usize,
}

/// Loads and persists the four pattern files, and builds the dangerous
/// detector's partitioned (regex, literal) sets.
pub struct PatternRegistry {
    dir: PathBuf,
    files: HashMap<PatternKind, RwLock<FileState>>,
    match_cache: DashMap<(PatternKind, String), bool>,
    dangerous_cache: DashMap<(String, String), bool>,
}

impl PatternRegistry {
    pub async fn load(dir: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let mut files = HashMap::new();
        for kind in PatternKind::ALL {
            let state = Self::load_file(&dir, kind).await?;
            files.insert(kind, RwLock::new(state));
        }
        Ok(Arc::new(Self {
            dir,
            files,
            match_cache: DashMap::new(),
            dangerous_cache: DashMap::new(),
        }))
    }

    fn path_for(dir: &Path, kind: PatternKind) -> PathBuf {
        dir.join(kind.filename())
    }

    async fn load_file(dir: &Path, kind: PatternKind) -> anyhow::Result<FileState> {
        let path = Self::path_for(dir, kind);
        if !path.exists() {
            tokio::fs::write(&path, b"").await?;
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        let mut entries = Vec::new();
        let mut invalid_count = 0usize;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record = serde_json::from_str::<PatternRecord>(line).or_else(|_| {
                serde_json::from_str::<LegacyPatternLine>(line).map(|legacy| PatternRecord {
                    id: Uuid::new_v4().to_string(),
                    description: legacy.pattern.clone(),
                    pattern: legacy.pattern,
                    kind,
                    created_at: Utc::now(),
                })
            });
            let Ok(record) = record else {
                invalid_count += 1;
                tracing::warn!(file = %path.display(), "skipping unparsable pattern line");
                continue;
            };
            match Regex::new(&record.pattern) {
                Ok(re) => entries.push(PatternEntry {
                    id: record.id,
                    kind,
                    regex: Some(Arc::new(re)),
                    source_string: record.pattern,
                    description: record.description,
                    created_at: record.created_at,
                }),
                Err(e) => {
                    invalid_count += 1;
                    tracing::warn!(pattern = %record.pattern, error = %e, "invalid regex, skipped");
                    entries.push(PatternEntry {
                        id: record.id,
                        kind,
                        regex: None,
                        source_string: record.pattern,
                        description: record.description,
                        created_at: record.created_at,
                    });
                }
            }
        }
        Ok(FileState {
            entries,
            invalid_count,
        })
    }

    async fn rewrite(&self, kind: PatternKind, state: &FileState) -> AppResult<()> {
        let path = Self::path_for(&self.dir, kind);
        let tmp = path.with_extension("tmp");
        let mut buf = String::new();
        for entry in &state.entries {
            let record = PatternRecord {
                id: entry.id.clone(),
                pattern: entry.source_string.clone(),
                description: entry.description.clone(),
                kind: entry.kind,
                created_at: entry.created_at,
            };
            buf.push_str(&serde_json::to_string(&record).map_err(|e| AppError::Store(e.to_string()))?);
            buf.push('\n');
        }
        tokio::fs::write(&tmp, buf.as_bytes())
            .await
            .map_err(|e| AppError::Store(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::Store(e.to_string()))?;
        Ok(())
    }

    pub async fn list(&self, kind: PatternKind) -> Vec<PatternEntry> {
        self.files[&kind].read().await.entries.clone()
    }

    pub async fn list_all(&self) -> Vec<PatternEntry> {
        let mut out = Vec::new();
        for kind in PatternKind::ALL {
            out.extend(self.files[&kind].read().await.entries.clone());
        }
        out
    }

    pub async fn validity_ratio(&self, kind: PatternKind) -> f64 {
        let state = self.files[&kind].read().await;
        let total = state.entries.len() + state.invalid_count;
        if total == 0 {
            1.0
        } else {
            state.entries.len() as f64 / total as f64
        }
    }

    pub async fn add(&self, kind: PatternKind, pattern: String, description: String) -> AppResult<PatternEntry> {
        let regex = Regex::new(&pattern).map_err(|e| AppError::validation(format!("invalid regex: {e}")))?;
        let entry = PatternEntry {
            id: Uuid::new_v4().to_string(),
            kind,
            regex: Some(Arc::new(regex)),
            source_string: pattern,
            description,
            created_at: Utc::now(),
        };
        let mut state = self.files[&kind].write().await;
        state.entries.push(entry.clone());
        self.rewrite(kind, &state).await?;
        self.match_cache.clear();
        self.dangerous_cache.clear();
        Ok(entry)
    }

    pub async fn remove(&self, kind: PatternKind, id: &str) -> AppResult<()> {
        let mut state = self.files[&kind].write().await;
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        if state.entries.len() == before {
            return Err(AppError::NotFound(format!("pattern {id}")));
        }
        self.rewrite(kind, &state).await?;
        self.match_cache.clear();
        self.dangerous_cache.clear();
        Ok(())
    }

    pub async fn update(
        &self,
        kind: PatternKind,
        id: &str,
        pattern: Option<String>,
        description: Option<String>,
    ) -> AppResult<PatternEntry> {
        let mut state = self.files[&kind].write().await;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AppError::NotFound(format!("pattern {id}")))?;
        if let Some(pattern) = pattern {
            let regex = Regex::new(&pattern).map_err(|e| AppError::validation(format!("invalid regex: {e}")))?;
            entry.regex = Some(Arc::new(regex));
            entry.source_string = pattern;
        }
        if let Some(description) = description {
            entry.description = description;
        }
        let updated = entry.clone();
        self.rewrite(kind, &state).await?;
        self.match_cache.clear();
        self.dangerous_cache.clear();
        Ok(updated)
    }

    /// Memoized `cached_pattern_match` (spec §4.1 step 3): does any
    /// compiled pattern of `kind` match `value`?
    pub async fn cached_pattern_match(&self, kind: PatternKind, value: &str) -> bool {
        let cache_key = (kind, value.to_string());
        if let Some(hit) = self.match_cache.get(&cache_key) {
            return *hit;
        }
        let state = self.files[&kind].read().await;
        let is_match = state
            .entries
            .iter()
            .filter_map(|e| e.regex.as_ref())
            .any(|re| re.is_match(value));
        self.match_cache.insert(cache_key, is_match);
        is_match
    }

    /// `dangerous_detector(ua, url)` (spec §4.2): regex-first,
    /// literal-substring fallback, short-circuit on first hit, memoized
    /// by (ua, url).
    pub async fn is_dangerous(&self, ua: &str, url: &str) -> bool {
        let cache_key = (ua.to_string(), url.to_string());
        if let Some(hit) = self.dangerous_cache.get(&cache_key) {
            return *hit;
        }
        let ua_state = self.files[&PatternKind::UaDangerous].read().await;
        let url_state = self.files[&PatternKind::UrlDangerous].read().await;

        let result = Self::detect_one(&ua_state, ua) || Self::detect_one(&url_state, url);
        self.dangerous_cache.insert(cache_key, result);
        result
    }

    fn detect_one(state: &FileState, haystack: &str) -> bool {
        // Regex-capable entries first, then literal-substring fallback,
        // matching the "partition into compilable/literal" build step.
        let regex_hit = state
            .entries
            .iter()
            .filter_map(|e| e.regex.as_ref())
            .any(|re| re.is_match(haystack));
        if regex_hit {
            return true;
        }
        state
            .entries
            .iter()
            .filter(|e| e.regex.is_none())
            .any(|e| haystack.contains(&e.source_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_remove_round_trips_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PatternRegistry::load(dir.path()).await.unwrap();
        let before = tokio::fs::read_to_string(PatternRegistry::path_for(dir.path(), PatternKind::Ua))
            .await
            .unwrap();
        let entry = registry
            .add(PatternKind::Ua, "sqlmap".into(), "sqlmap scanner".into())
            .await
            .unwrap();
        registry.remove(PatternKind::Ua, &entry.id).await.unwrap();
        let after = tokio::fs::read_to_string(PatternRegistry::path_for(dir.path(), PatternKind::Ua))
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn invalid_regex_is_skipped_but_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = PatternRegistry::path_for(dir.path(), PatternKind::Url);
        let bad = PatternRecord {
            id: "x".into(),
            pattern: "(unclosed".into(),
            description: "bad".into(),
            kind: PatternKind::Url,
            created_at: Utc::now(),
        };
        tokio::fs::write(&path, format!("{}\n", serde_json::to_string(&bad).unwrap()))
            .await
            .unwrap();
        let registry = PatternRegistry::load(dir.path()).await.unwrap();
        assert!(registry.validity_ratio(PatternKind::Url).await < 1.0);
    }

    #[tokio::test]
    async fn dangerous_detector_short_circuits_regex_then_literal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PatternRegistry::load(dir.path()).await.unwrap();
        registry
            .add(PatternKind::UaDangerous, "sqlmap".into(), "sqlmap".into())
            .await
            .unwrap();
        assert!(registry.is_dangerous("sqlmap/1.5", "/").await);
        assert!(!registry.is_dangerous("curl/8.0", "/").await);
    }
}
