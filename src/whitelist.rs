//! Whitelist Engine (spec §4.4).
//!
//! Persistent `{ip, cidr, domain}` entries with descriptions, backed by a
//! single JSON file holding an `entries` table and a `metadata` table
//! (mirroring the two-table relational file described in spec §6).
//! Membership snapshots are rebuilt off-lock and swapped in atomically;
//! readers only ever take a shared lock for the membership test itself.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhitelistKind {
    Ip,
    Cidr,
    Domain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: WhitelistKind,
    pub value: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WhitelistFile {
    entries: Vec<WhitelistEntry>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// The rebuildable, swap-under-lock membership snapshot.
#[derive(Default, Clone)]
struct Snapshot {
    ips: HashSet<IpAddr>,
    cidrs: Vec<IpNetwork>,
    resolved_domain_ips: HashSet<IpAddr>,
}

impl Snapshot {
    fn contains(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip)
            || self.resolved_domain_ips.contains(&ip)
            || self.cidrs.iter().any(|net| net.contains(ip))
    }
}

pub struct WhitelistEngine {
    path: PathBuf,
    file: RwLock<WhitelistFile>,
    snapshot: RwLock<Arc<Snapshot>>,
    last_mtime: AtomicI64,
}

impl WhitelistEngine {
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let path = path.into();
        let file = Self::read_or_create(&path).await?;
        let snapshot = build_snapshot(&file.entries, &HashSet::new());
        let mtime = mtime_secs(&path).await.unwrap_or(0);
        Ok(Arc::new(Self {
            path,
            file: RwLock::new(file),
            snapshot: RwLock::new(Arc::new(snapshot)),
            last_mtime: AtomicI64::new(mtime),
        }))
    }

    async fn read_or_create(path: &Path) -> anyhow::Result<WhitelistFile> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, serde_json::to_vec_pretty(&WhitelistFile::default())?).await?;
        }
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    async fn persist(&self, file: &WhitelistFile) -> AppResult<()> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(file).map_err(|e| AppError::Store(e.to_string()))?;
        tokio::fs::write(&tmp, bytes).await.map_err(|e| AppError::Store(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| AppError::Store(e.to_string()))?;
        let mtime = mtime_secs(&self.path).await.unwrap_or(0);
        self.last_mtime.store(mtime, Ordering::SeqCst);
        Ok(())
    }

    pub async fn list(&self) -> Vec<WhitelistEntry> {
        self.file.read().await.entries.clone()
    }

    pub async fn search(&self, query: &str) -> Vec<WhitelistEntry> {
        let q = query.to_lowercase();
        self.file
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.value.to_lowercase().contains(&q) || e.description.to_lowercase().contains(&q))
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> HashMap<&'static str, usize> {
        let entries = &self.file.read().await.entries;
        let mut stats = HashMap::new();
        stats.insert("ip", entries.iter().filter(|e| e.kind == WhitelistKind::Ip).count());
        stats.insert("cidr", entries.iter().filter(|e| e.kind == WhitelistKind::Cidr).count());
        stats.insert("domain", entries.iter().filter(|e| e.kind == WhitelistKind::Domain).count());
        stats
    }

    pub async fn metadata(&self) -> HashMap<String, String> {
        self.file.read().await.metadata.clone()
    }

    fn validate_grammar(kind: WhitelistKind, value: &str) -> AppResult<()> {
        match kind {
            WhitelistKind::Ip => value
                .parse::<IpAddr>()
                .map(|_| ())
                .map_err(|_| AppError::validation(format!("invalid IP: {value}"))),
            WhitelistKind::Cidr => value
                .parse::<IpNetwork>()
                .map(|_| ())
                .map_err(|_| AppError::validation(format!("invalid CIDR: {value}"))),
            WhitelistKind::Domain => {
                if value.is_empty() || value.contains(char::is_whitespace) {
                    Err(AppError::validation(format!("invalid domain: {value}")))
                } else {
                    Ok(())
                }
            }
        }
    }

    pub async fn add(&self, kind: WhitelistKind, value: String, description: String) -> AppResult<WhitelistEntry> {
        Self::validate_grammar(kind, &value)?;
        let mut file = self.file.write().await;
        if file.entries.iter().any(|e| e.kind == kind && e.value == value) {
            return Err(AppError::Conflict(format!("{value} already whitelisted")));
        }
        let entry = WhitelistEntry {
            id: Uuid::new_v4().to_string(),
            kind,
            value,
            description,
            created_at: Utc::now(),
        };
        file.entries.push(entry.clone());
        self.persist(&file).await?;
        self.rebuild_static().await;
        Ok(entry)
    }

    pub async fn remove(&self, id: &str) -> AppResult<()> {
        let mut file = self.file.write().await;
        let before = file.entries.len();
        file.entries.retain(|e| e.id != id);
        if file.entries.len() == before {
            return Err(AppError::NotFound(format!("whitelist entry {id}")));
        }
        self.persist(&file).await?;
        self.rebuild_static().await;
        Ok(())
    }

    pub async fn update(&self, id: &str, value: Option<String>, description: Option<String>) -> AppResult<WhitelistEntry> {
        let mut file = self.file.write().await;
        let entry = file
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AppError::NotFound(format!("whitelist entry {id}")))?;
        if let Some(value) = value {
            Self::validate_grammar(entry.kind, &value)?;
            entry.value = value;
        }
        if let Some(description) = description {
            entry.description = description;
        }
        let updated = entry.clone();
        self.persist(&file).await?;
        self.rebuild_static().await;
        Ok(updated)
    }

    async fn rebuild_static(&self) {
        let resolved = self.snapshot.read().await.resolved_domain_ips.clone();
        let entries = self.file.read().await.entries.clone();
        let snapshot = build_snapshot(&entries, &resolved);
        *self.snapshot.write().await = Arc::new(snapshot);
    }

    /// `membership(candidate)` (spec §4.4): pure function of the current
    /// snapshot — parse as IP, test set/CIDR/resolved-domain membership.
    pub async fn is_whitelisted(&self, candidate: &str) -> bool {
        let Ok(ip) = candidate.parse::<IpAddr>() else {
            return false;
        };
        self.snapshot.read().await.contains(ip)
    }

    /// Re-resolve every domain entry (spec §4.4 "domain refresh"):
    /// per-domain errors are logged, never fatal.
    pub async fn refresh_domains(&self) {
        let domains: Vec<String> = self
            .file
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.kind == WhitelistKind::Domain)
            .map(|e| e.value.clone())
            .collect();

        let mut resolved = HashSet::new();
        for domain in domains {
            match tokio::net::lookup_host((domain.as_str(), 0)).await {
                Ok(addrs) => resolved.extend(addrs.map(|a| a.ip())),
                Err(e) => tracing::warn!(domain = %domain, error = %e, "domain resolution failed"),
            }
        }

        let entries = self.file.read().await.entries.clone();
        let snapshot = build_snapshot(&entries, &resolved);
        *self.snapshot.write().await = Arc::new(snapshot);
    }

    /// Background loop: poll store mtime, rebuild the in-memory snapshot
    /// from disk on change (spec §4.4 "Reload").
    pub async fn reload_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(mtime) = mtime_secs(&self.path).await else {
                continue;
            };
            if mtime != self.last_mtime.load(Ordering::SeqCst) {
                match Self::read_or_create(&self.path).await {
                    Ok(file) => {
                        *self.file.write().await = file;
                        self.last_mtime.store(mtime, Ordering::SeqCst);
                        self.rebuild_static().await;
                        tracing::info!("whitelist reloaded from disk");
                    }
                    Err(e) => tracing::warn!("failed to reload whitelist: {e}"),
                }
            }
        }
    }

    /// Background loop: re-resolve domains on a separate cadence (spec
    /// §4.4 "Domain refresh", default 300s).
    pub async fn domain_refresh_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.refresh_domains().await;
        }
    }
}

fn build_snapshot(entries: &[WhitelistEntry], resolved_domain_ips: &HashSet<IpAddr>) -> Snapshot {
    let mut ips = HashSet::new();
    let mut cidrs = Vec::new();
    for entry in entries {
        match entry.kind {
            WhitelistKind::Ip => {
                if let Ok(ip) = entry.value.parse() {
                    ips.insert(ip);
                }
            }
            WhitelistKind::Cidr => {
                if let Ok(net) = entry.value.parse() {
                    cidrs.push(net);
                }
            }
            WhitelistKind::Domain => {}
        }
    }
    Snapshot {
        ips,
        cidrs,
        resolved_domain_ips: resolved_domain_ips.clone(),
    }
}

async fn mtime_secs(path: &Path) -> Option<i64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let modified = meta.modified().ok()?;
    Some(modified.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_remove_round_trips_membership() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WhitelistEngine::load(dir.path().join("whitelist.json")).await.unwrap();
        assert!(!engine.is_whitelisted("10.1.2.3").await);
        let entry = engine
            .add(WhitelistKind::Cidr, "10.0.0.0/8".into(), "internal".into())
            .await
            .unwrap();
        assert!(engine.is_whitelisted("10.1.2.3").await);
        engine.remove(&entry.id).await.unwrap();
        assert!(!engine.is_whitelisted("10.1.2.3").await);
    }

    #[tokio::test]
    async fn duplicate_type_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WhitelistEngine::load(dir.path().join("whitelist.json")).await.unwrap();
        engine.add(WhitelistKind::Ip, "1.2.3.4".into(), "a".into()).await.unwrap();
        let result = engine.add(WhitelistKind::Ip, "1.2.3.4".into(), "b".into()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invalid_grammar_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WhitelistEngine::load(dir.path().join("whitelist.json")).await.unwrap();
        assert!(engine.add(WhitelistKind::Ip, "not-an-ip".into(), "x".into()).await.is_err());
        assert!(engine.add(WhitelistKind::Cidr, "not-a-cidr".into(), "x".into()).await.is_err());
    }
}
