//! Ban Orchestrator (spec §4.5): single-consumer batcher over ban
//! requests, fail2ban-client invocation, idempotent table persistence,
//! CIDR sweeps, and IP-state cleanup.

pub mod fail2ban;
pub mod store;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::errors::{AppError, AppResult};
use crate::geo::GeoDataset;
use crate::ip_state::IpStateManager;
use crate::mail::Mailer;
use fail2ban::Fail2Ban;
use store::{AutomaticBan, BanStore, ManualBan};

pub const BATCH_SIZE: usize = 10;
pub const BATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanKind {
    Automatic,
    Manual,
}

/// A single ban request flowing through the channel (spec §4.5 "Request
/// types"); construction helpers keep the Log Pipeline's call sites terse.
#[derive(Debug, Clone)]
pub enum BanRequest {
    Automatic {
        ip: String,
        reason: String,
        domain: String,
        user_agent: String,
        http_code: Option<u16>,
        url: String,
    },
    Manual {
        ip_or_cidr: String,
        reason: String,
    },
    MultipleCidrs(Vec<(String, String)>),
    Unban {
        ip_or_cidr: String,
        kind: BanKind,
    },
}

impl BanRequest {
    pub fn automatic(ip: String, reason: String, domain: String, user_agent: String, http_code: u16, url: String) -> Self {
        BanRequest::Automatic {
            ip,
            reason,
            domain,
            user_agent,
            http_code: Some(http_code),
            url,
        }
    }
}

pub struct BanOrchestrator {
    store: BanStore,
    fail2ban: Fail2Ban,
    ip_state: Arc<IpStateManager>,
    geo: Arc<GeoDataset>,
    mailer: Option<Arc<Mailer>>,
}

impl BanOrchestrator {
    pub fn new(
        store: BanStore,
        jail: impl Into<String>,
        ip_state: Arc<IpStateManager>,
        geo: Arc<GeoDataset>,
        mailer: Option<Arc<Mailer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            fail2ban: Fail2Ban::new(jail),
            ip_state,
            geo,
            mailer,
        })
    }

    pub fn store(&self) -> &BanStore {
        &self.store
    }

    /// Single-consumer batch loop (spec §4.5 "Batching", §5 "Ban
    /// batcher"): drains up to `BATCH_SIZE` requests or flushes on a
    /// 0.5 s timeout, whichever comes first, preserving total order.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<BanRequest>) {
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        loop {
            let deadline = Instant::now() + BATCH_FLUSH_INTERVAL;
            while batch.len() < BATCH_SIZE {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some(req)) => batch.push(req),
                    Ok(None) => {
                        self.flush(std::mem::take(&mut batch)).await;
                        return;
                    }
                    Err(_) => break,
                }
            }
            if !batch.is_empty() {
                self.flush(std::mem::take(&mut batch)).await;
            }
        }
    }

    async fn flush(&self, batch: Vec<BanRequest>) {
        for request in batch {
            if let Err(e) = self.handle_one(request).await {
                tracing::debug!("ban request rejected: {e}");
            }
        }
    }

    async fn handle_one(&self, request: BanRequest) -> AppResult<()> {
        match request {
            BanRequest::Automatic {
                ip,
                reason,
                domain,
                user_agent,
                http_code,
                url,
            } => self.ban_automatic(ip, reason, domain, user_agent, http_code, url).await,
            BanRequest::Manual { ip_or_cidr, reason } => self.ban_manual(ip_or_cidr, reason).await.map(|_| ()),
            BanRequest::MultipleCidrs(entries) => self.ban_multiple_cidrs(entries).await.map(|_| ()),
            BanRequest::Unban { ip_or_cidr, kind } => self.unban(&ip_or_cidr, kind).await,
        }
    }

    pub async fn ban_automatic(
        &self,
        ip: String,
        reason: String,
        domain: String,
        user_agent: String,
        http_code: Option<u16>,
        url: String,
    ) -> AppResult<AutomaticBan> {
        let parsed: IpAddr = ip.parse().map_err(|_| AppError::validation(format!("invalid IP: {ip}")))?;

        if self.store.is_automatic_banned(&ip).await {
            return Err(AppError::AlreadyBanned(ip));
        }

        if let Err(e) = self.fail2ban.ban(&ip).await {
            // step 4: automatic bans are logged-but-not-failed on firewall error.
            tracing::warn!(%ip, error = %e, "fail2ban ban failed for automatic ban, inserting row anyway");
        }

        let geo = self.geo.lookup(parsed);
        let row = self
            .store
            .insert_automatic(ip.clone(), domain, user_agent, http_code, url, geo.as_ref())
            .await?;

        self.ip_state.forget(&ip).await;

        if let Some(mailer) = &self.mailer {
            mailer.notify_ban(&ip, &reason).await;
        }
        Ok(row)
    }

    pub async fn ban_manual(&self, ip_or_cidr: String, reason: String) -> AppResult<ManualBan> {
        if reason.trim().len() < 3 {
            return Err(AppError::validation("reason must be at least 3 characters"));
        }

        let parsed_ip = ip_or_cidr.parse::<IpAddr>().ok();
        let parsed_cidr = ip_or_cidr.parse::<IpNetwork>().ok();
        if parsed_ip.is_none() && parsed_cidr.is_none() {
            return Err(AppError::validation(format!("invalid IP or CIDR: {ip_or_cidr}")));
        }

        if let Some(ip) = parsed_ip {
            if let Some(cidr) = self.store.is_ip_in_any_cidr(ip).await {
                return Err(AppError::CoveredByCidr(format!("{ip_or_cidr} is covered by {cidr}")));
            }
        }

        if self.store.is_manual_banned(&ip_or_cidr).await {
            return Err(AppError::AlreadyBanned(ip_or_cidr));
        }

        // manual: fail closed on any non-success signal from fail2ban-client
        match self.fail2ban.ban(&ip_or_cidr).await {
            Ok(true) => {}
            Ok(false) => return Err(AppError::Firewall(format!("fail2ban-client did not confirm ban of {ip_or_cidr}"))),
            Err(e) => return Err(e),
        }

        let geo = parsed_ip.and_then(|ip| self.geo.lookup(ip));
        let row = self.store.insert_manual(ip_or_cidr.clone(), reason, geo.as_ref()).await?;

        if let Some(ip) = parsed_ip {
            self.ip_state.forget(&ip.to_string()).await;
        }
        Ok(row)
    }

    /// spec §4.5 "CIDR embedded-IP sweep"; returns `(ips_unbanned,
    /// manual_ban_rows)` for API response shaping.
    pub async fn ban_multiple_cidrs(&self, entries: Vec<(String, String)>) -> AppResult<(usize, Vec<ManualBan>)> {
        let mut created = Vec::with_capacity(entries.len());
        let mut total_unbanned = 0usize;
        for (cidr_str, reason) in entries {
            let cidr: IpNetwork = cidr_str.parse().map_err(|_| AppError::validation(format!("invalid CIDR: {cidr_str}")))?;
            let row = self.ban_manual(cidr_str, reason).await?;

            let swept_ips = self.store.sweep_cidr(cidr).await;
            for ip in &swept_ips {
                if let Err(e) = self.fail2ban.unban(ip).await {
                    tracing::debug!(%ip, error = %e, "best-effort unban during CIDR sweep failed");
                }
                self.ip_state.forget(ip).await;
            }
            total_unbanned += swept_ips.len();
            created.push(row);
        }
        Ok((total_unbanned, created))
    }

    pub async fn unban(&self, ip_or_cidr: &str, kind: BanKind) -> AppResult<()> {
        let _ = self.fail2ban.unban(ip_or_cidr).await; // best-effort
        match kind {
            BanKind::Automatic => self.store.remove_automatic_by_ip(ip_or_cidr).await,
            BanKind::Manual => self.store.remove_manual(ip_or_cidr).await,
        }
    }

    /// spec §4.7 "CIDR ... unban-ips": sweep ban rows covered by `cidr`
    /// and lift their bans, without recording a new manual-ban row for
    /// the CIDR itself (unlike `ban_multiple_cidrs`, which does both).
    pub async fn unban_ips_in_cidr(&self, cidr: IpNetwork) -> Vec<String> {
        let swept = self.store.sweep_cidr(cidr).await;
        for ip in &swept {
            if let Err(e) = self.fail2ban.unban(ip).await {
                tracing::debug!(%ip, error = %e, "best-effort unban during CIDR unban-ips failed");
            }
            self.ip_state.forget(ip).await;
        }
        swept
    }

    /// spec §4.7 "CIDR check-ips": preview which currently-banned IPs
    /// fall inside `cidr`, without mutating anything.
    pub async fn ips_in_cidr(&self, cidr: IpNetwork) -> Vec<String> {
        let mut hits = Vec::new();
        for row in self.store.list_automatic().await {
            if row.ip.parse::<IpAddr>().is_ok_and(|ip| cidr.contains(ip)) {
                hits.push(row.ip);
            }
        }
        for row in self.store.list_manual().await {
            if !row.ip_or_cidr.contains('/') && row.ip_or_cidr.parse::<IpAddr>().is_ok_and(|ip| cidr.contains(ip)) {
                hits.push(row.ip_or_cidr);
            }
        }
        hits
    }

    pub async fn fail2ban_status(&self) -> AppResult<String> {
        self.fail2ban.status().await
    }

    pub async fn fail2ban_ping(&self) -> bool {
        self.fail2ban.ping().await
    }

    pub fn geo(&self) -> &GeoDataset {
        &self.geo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automatic_constructor_sets_reason_and_fields() {
        let req = BanRequest::automatic(
            "1.2.3.4".into(),
            "dangerous".into(),
            "example.com".into(),
            "sqlmap".into(),
            200,
            "/".into(),
        );
        match req {
            BanRequest::Automatic { ip, reason, http_code, .. } => {
                assert_eq!(ip, "1.2.3.4");
                assert_eq!(reason, "dangerous");
                assert_eq!(http_code, Some(200));
            }
            _ => panic!("expected automatic variant"),
        }
    }
}
