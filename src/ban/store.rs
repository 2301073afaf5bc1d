//! Ban tables: `automatic_bans` and `manual_bans` (spec §3 data model).
//!
//! Each is a JSON-file-backed table, same write-temp + rename discipline
//! as the whitelist and pattern stores. The Ban Orchestrator is the only
//! writer; readers (API) take the shared lock.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::geo::LookupResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomaticBan {
    pub id: String,
    pub ip: String,
    pub ban_timestamp: DateTime<Utc>,
    pub domain: String,
    pub user_agent: String,
    pub http_code: Option<u16>,
    pub url: String,
    pub network: Option<String>,
    pub asn: Option<String>,
    pub organization: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualBan {
    pub id: String,
    pub ip_or_cidr: String,
    pub reason: String,
    pub ban_timestamp: DateTime<Utc>,
    pub network: Option<String>,
    pub asn: Option<String>,
    pub organization: Option<String>,
    pub country: Option<String>,
}

fn geo_fields(lookup: Option<&LookupResult>) -> (Option<String>, Option<String>, Option<String>, Option<String>) {
    match lookup {
        Some(r) => (
            Some(r.row.network.clone()),
            Some(r.row.asn.clone()),
            Some(r.row.organization.clone()),
            Some(r.row.country.clone()),
        ),
        None => (None, None, None, None),
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Tables {
    automatic: Vec<AutomaticBan>,
    manual: Vec<ManualBan>,
}

pub struct BanStore {
    path: PathBuf,
    tables: RwLock<Tables>,
}

impl BanStore {
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let tables = Self::read_or_create(&path).await?;
        Ok(Self {
            path,
            tables: RwLock::new(tables),
        })
    }

    async fn read_or_create(path: &Path) -> anyhow::Result<Tables> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, serde_json::to_vec_pretty(&Tables::default())?).await?;
        }
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    async fn persist(&self, tables: &Tables) -> AppResult<()> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(tables).map_err(|e| AppError::Store(e.to_string()))?;
        tokio::fs::write(&tmp, bytes).await.map_err(|e| AppError::Store(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| AppError::Store(e.to_string()))?;
        Ok(())
    }

    pub async fn list_automatic(&self) -> Vec<AutomaticBan> {
        self.tables.read().await.automatic.clone()
    }

    pub async fn list_manual(&self) -> Vec<ManualBan> {
        self.tables.read().await.manual.clone()
    }

    /// spec §4.5 step 2: idempotency check, called ahead of the
    /// fail2ban-client invocation so a repeat ban request never shells
    /// out before being rejected.
    pub async fn is_automatic_banned(&self, ip: &str) -> bool {
        self.tables.read().await.automatic.iter().any(|row| row.ip == ip)
    }

    /// spec §4.5 step 2: idempotency check, manual table.
    pub async fn is_manual_banned(&self, ip_or_cidr: &str) -> bool {
        self.tables.read().await.manual.iter().any(|row| row.ip_or_cidr == ip_or_cidr)
    }

    pub async fn is_ip_in_any_cidr(&self, ip: std::net::IpAddr) -> Option<String> {
        let tables = self.tables.read().await;
        tables
            .manual
            .iter()
            .find(|row| row.ip_or_cidr.parse::<IpNetwork>().map(|net| net.contains(ip)).unwrap_or(false))
            .map(|row| row.ip_or_cidr.clone())
    }

    /// spec §4.5 step 2: idempotency check against the automatic table.
    pub async fn insert_automatic(
        &self,
        ip: String,
        domain: String,
        user_agent: String,
        http_code: Option<u16>,
        url: String,
        geo: Option<&LookupResult>,
    ) -> AppResult<AutomaticBan> {
        let mut tables = self.tables.write().await;
        if tables.automatic.iter().any(|row| row.ip == ip) {
            return Err(AppError::AlreadyBanned(ip));
        }
        let (network, asn, organization, country) = geo_fields(geo);
        let row = AutomaticBan {
            id: Uuid::new_v4().to_string(),
            ip,
            ban_timestamp: Utc::now(),
            domain,
            user_agent,
            http_code,
            url,
            network,
            asn,
            organization,
            country,
        };
        tables.automatic.push(row.clone());
        self.persist(&tables).await?;
        Ok(row)
    }

    /// spec §4.5 step 2/3: idempotency against manual table, plus
    /// CIDR-coverage check for single-IP manual requests (caller passes
    /// `covering_cidr` pre-resolved via `is_ip_in_any_cidr`).
    pub async fn insert_manual(
        &self,
        ip_or_cidr: String,
        reason: String,
        geo: Option<&LookupResult>,
    ) -> AppResult<ManualBan> {
        let mut tables = self.tables.write().await;
        if tables.manual.iter().any(|row| row.ip_or_cidr == ip_or_cidr) {
            return Err(AppError::AlreadyBanned(ip_or_cidr));
        }
        let (network, asn, organization, country) = geo_fields(geo);
        let row = ManualBan {
            id: Uuid::new_v4().to_string(),
            ip_or_cidr,
            reason,
            ban_timestamp: Utc::now(),
            network,
            asn,
            organization,
            country,
        };
        tables.manual.push(row.clone());
        self.persist(&tables).await?;
        Ok(row)
    }

    pub async fn remove_automatic_by_ip(&self, ip: &str) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let before = tables.automatic.len();
        tables.automatic.retain(|row| row.ip != ip);
        if tables.automatic.len() == before {
            return Err(AppError::NotFound(format!("automatic ban {ip}")));
        }
        self.persist(&tables).await
    }

    pub async fn remove_manual(&self, ip_or_cidr: &str) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let before = tables.manual.len();
        tables.manual.retain(|row| row.ip_or_cidr != ip_or_cidr);
        if tables.manual.len() == before {
            return Err(AppError::NotFound(format!("manual ban {ip_or_cidr}")));
        }
        self.persist(&tables).await
    }

    /// spec §4.5 "CIDR embedded-IP sweep": every row (either table) whose
    /// bare IP lies inside `cidr` is removed; returns the removed IPs so
    /// the caller can issue best-effort `unbanip` calls.
    pub async fn sweep_cidr(&self, cidr: IpNetwork) -> Vec<String> {
        let mut tables = self.tables.write().await;
        let mut removed = Vec::new();

        let mut kept_auto = Vec::with_capacity(tables.automatic.len());
        for row in tables.automatic.drain(..) {
            let covered = row.ip.parse::<std::net::IpAddr>().map(|ip| cidr.contains(ip)).unwrap_or(false);
            if covered {
                removed.push(row.ip.clone());
            } else {
                kept_auto.push(row);
            }
        }
        tables.automatic = kept_auto;

        let mut kept_manual = Vec::with_capacity(tables.manual.len());
        for row in tables.manual.drain(..) {
            // Never sweep other CIDR rows (`%/%` entries), only bare IPs.
            let is_bare_ip = !row.ip_or_cidr.contains('/');
            let covered = is_bare_ip
                && row.ip_or_cidr.parse::<std::net::IpAddr>().map(|ip| cidr.contains(ip)).unwrap_or(false);
            if covered {
                removed.push(row.ip_or_cidr.clone());
            } else {
                kept_manual.push(row);
            }
        }
        tables.manual = kept_manual;

        if let Err(e) = self.persist(&tables).await {
            tracing::warn!("failed to persist ban tables after CIDR sweep: {e}");
        }
        removed
    }

    pub async fn counts(&self) -> (usize, usize) {
        let tables = self.tables.read().await;
        (tables.automatic.len(), tables.manual.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn automatic_insert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BanStore::load(dir.path().join("bans.json")).await.unwrap();
        store
            .insert_automatic("1.2.3.4".into(), "example.com".into(), "sqlmap".into(), Some(200), "/".into(), None)
            .await
            .unwrap();
        let result = store
            .insert_automatic("1.2.3.4".into(), "example.com".into(), "sqlmap".into(), Some(200), "/".into(), None)
            .await;
        assert!(matches!(result, Err(AppError::AlreadyBanned(_))));
    }

    #[tokio::test]
    async fn cidr_sweep_removes_embedded_ips_but_not_other_cidrs() {
        let dir = tempfile::tempdir().unwrap();
        let store = BanStore::load(dir.path().join("bans.json")).await.unwrap();
        store
            .insert_automatic("203.0.113.10".into(), "d".into(), "ua".into(), Some(404), "/".into(), None)
            .await
            .unwrap();
        store
            .insert_manual("203.0.113.200".into(), "manual reason".into(), None)
            .await
            .unwrap();
        store
            .insert_manual("198.51.100.0/24".into(), "unrelated cidr".into(), None)
            .await
            .unwrap();

        let removed = store.sweep_cidr("203.0.113.0/24".parse().unwrap()).await;
        assert_eq!(removed.len(), 2);
        let (auto_count, manual_count) = store.counts().await;
        assert_eq!(auto_count, 0);
        assert_eq!(manual_count, 1);
    }
}
