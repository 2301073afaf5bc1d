//! Config Store: JSON-backed, process-wide configuration (spec §2, §6).
//!
//! Mirrors `conf.local` from the original system: if the file is missing
//! it is created with defaults, then reloaded whenever its mtime changes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShieldConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub ignore_whitelist: bool,
    #[serde(default)]
    pub enable_whitelist_log: bool,
    #[serde(default = "default_codes_to_allow")]
    pub codes_to_allow: Vec<u16>,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_time_frame")]
    pub time_frame: u64,
    #[serde(default = "default_jail_name")]
    pub jail_name: String,
}

fn default_log_dir() -> String {
    "/var/log/nginx".to_string()
}
fn default_codes_to_allow() -> Vec<u16> {
    vec![200, 301, 302, 304]
}
fn default_max_requests() -> u32 {
    20
}
fn default_time_frame() -> u64 {
    3600
}
fn default_jail_name() -> String {
    "nginx-shield".to_string()
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            ignore_whitelist: false,
            enable_whitelist_log: false,
            codes_to_allow: default_codes_to_allow(),
            max_requests: default_max_requests(),
            time_frame: default_time_frame(),
            jail_name: default_jail_name(),
        }
    }
}

impl ShieldConfig {
    pub fn allows(&self, code: u16) -> bool {
        self.codes_to_allow.contains(&code)
    }
}

/// Shared, hot-reloadable handle on the configuration file.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<ShieldConfig>,
    last_mtime: AtomicI64,
}

impl ConfigStore {
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let path = path.into();
        let (config, mtime) = Self::read_or_create(&path).await?;
        Ok(Arc::new(Self {
            path,
            current: RwLock::new(config),
            last_mtime: AtomicI64::new(mtime),
        }))
    }

    async fn read_or_create(path: &Path) -> anyhow::Result<(ShieldConfig, i64)> {
        if !path.exists() {
            let config = ShieldConfig::default();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = serde_json::to_vec_pretty(&config)?;
            tokio::fs::write(path, bytes).await?;
            tracing::info!(path = %path.display(), "created default config file");
        }
        let contents = tokio::fs::read_to_string(path).await?;
        let config: ShieldConfig = serde_json::from_str(&contents)?;
        let mtime = mtime_secs(path).await.unwrap_or(0);
        Ok((config, mtime))
    }

    pub async fn get(&self) -> ShieldConfig {
        self.current.read().await.clone()
    }

    pub async fn replace(&self, config: ShieldConfig) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(&config)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        let mtime = mtime_secs(&self.path).await.unwrap_or(0);
        self.last_mtime.store(mtime, Ordering::SeqCst);
        *self.current.write().await = config;
        Ok(())
    }

    /// Background task: poll the file's mtime and hot-reload on change.
    pub async fn reload_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let Some(mtime) = mtime_secs(&self.path).await else {
                continue;
            };
            if mtime != self.last_mtime.load(Ordering::SeqCst) {
                match tokio::fs::read_to_string(&self.path).await {
                    Ok(contents) => match serde_json::from_str::<ShieldConfig>(&contents) {
                        Ok(config) => {
                            *self.current.write().await = config;
                            self.last_mtime.store(mtime, Ordering::SeqCst);
                            tracing::info!("configuration reloaded from disk");
                        }
                        Err(e) => tracing::warn!("config file invalid, keeping old config: {e}"),
                    },
                    Err(e) => tracing::warn!("failed to read config file: {e}"),
                }
            }
        }
    }
}

async fn mtime_secs(path: &Path) -> Option<i64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let modified = meta.modified().ok()?;
    let dur = modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Some(dur.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.local");
        let store = ConfigStore::load(&path).await.unwrap();
        assert!(path.exists());
        let config = store.get().await;
        assert_eq!(config.jail_name, "nginx-shield");
        assert!(config.allows(200));
        assert!(!config.allows(404));
    }

    #[tokio::test]
    async fn replace_persists_and_updates_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.local");
        let store = ConfigStore::load(&path).await.unwrap();
        let mut config = store.get().await;
        config.max_requests = 7;
        store.replace(config).await.unwrap();
        assert_eq!(store.get().await.max_requests, 7);
        let reread: ShieldConfig =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(reread.max_requests, 7);
    }
}
