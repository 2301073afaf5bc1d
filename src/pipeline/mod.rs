//! Log Pipeline (spec §4.1): discovery, tailing, parsing, classification,
//! decision, and enqueue into the ban/log channels.

pub mod parse;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use linemux::MuxedLines;
use tokio::sync::mpsc;

use crate::ban::BanRequest;
use crate::config::ConfigStore;
use crate::ip_state::IpStateManager;
use crate::patterns::{PatternKind, PatternRegistry};
use crate::whitelist::WhitelistEngine;
use parse::{AccessRecord, ParsedLine};

pub const BAN_CHANNEL_CAPACITY: usize = 1000;
pub const LOG_CHANNEL_CAPACITY: usize = 5000;

/// A decided, already-classified event headed for the log sink.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub ip: String,
    pub domain: String,
    pub url: String,
    pub user_agent: String,
    pub http_code: Option<u16>,
    pub decision: &'static str,
}

#[derive(Default)]
pub struct PipelineMetrics {
    pub ban_channel_drops: AtomicU64,
    pub log_channel_drops: AtomicU64,
    pub lines_processed: AtomicU64,
    pub whitelist_hits: AtomicU64,
}

pub struct Pipeline {
    pub config: Arc<ConfigStore>,
    pub patterns: Arc<PatternRegistry>,
    pub whitelist: Arc<WhitelistEngine>,
    pub ip_state: Arc<IpStateManager>,
    pub ban_tx: mpsc::Sender<BanRequest>,
    pub log_tx: mpsc::Sender<LogEvent>,
    pub metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn channels() -> (
        mpsc::Sender<BanRequest>,
        mpsc::Receiver<BanRequest>,
        mpsc::Sender<LogEvent>,
        mpsc::Receiver<LogEvent>,
    ) {
        let (ban_tx, ban_rx) = mpsc::channel(BAN_CHANNEL_CAPACITY);
        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        (ban_tx, ban_rx, log_tx, log_rx)
    }

    /// Discover files matching the glob under `log_dir` every 5 seconds
    /// and add newly-seen ones to a shared `MuxedLines` multiplexer,
    /// which survives rotation/truncation internally (spec §4.1 "File
    /// discovery" and "Followers must survive...").
    pub async fn run(self: Arc<Self>, glob_pattern: String) -> anyhow::Result<()> {
        let mut lines = MuxedLines::new()?;
        let mut known = std::collections::HashSet::new();
        let pipeline = self.clone();

        let discovery_lines = Arc::new(tokio::sync::Mutex::new(lines));
        {
            let discovery_lines = discovery_lines.clone();
            let glob_pattern = glob_pattern.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                loop {
                    ticker.tick().await;
                    discover_once(&glob_pattern, &discovery_lines, &mut known).await;
                }
            });
        }

        loop {
            let next = { discovery_lines.lock().await.next_line().await };
            match next {
                Ok(Some(line)) => {
                    let text = line.line().to_string();
                    let pipeline = pipeline.clone();
                    tokio::spawn(async move {
                        pipeline.process_line(&text).await;
                    });
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    tracing::debug!("log follower read error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process_line(&self, text: &str) {
        self.metrics.lines_processed.fetch_add(1, Ordering::Relaxed);
        let Some(parsed) = parse::parse_line(text) else {
            return;
        };
        match parsed {
            ParsedLine::Error(_err) => {
                // Error-log lines never drive a ban decision; they would
                // only be forwarded to the whitelist/error log sink,
                // which is handled by the log writer subscribing to
                // raw tailed files directly (spec §4.1 item 3).
            }
            ParsedLine::Access(access) => self.decide(access).await,
        }
    }

    async fn decide(&self, access: AccessRecord) {
        let config = self.config.get().await;

        if !config.ignore_whitelist && self.whitelist.is_whitelisted(&access.ip).await {
            self.metrics.whitelist_hits.fetch_add(1, Ordering::Relaxed);
            if config.enable_whitelist_log {
                self.send_log(LogEvent {
                    ip: access.ip,
                    domain: access.domain,
                    url: access.url,
                    user_agent: access.user_agent,
                    http_code: Some(access.http_code),
                    decision: "whitelisted",
                })
                .await;
            }
            return;
        }

        let _url_class = self.patterns.cached_pattern_match(PatternKind::Url, &access.url).await;
        let _ua_class = self.patterns.cached_pattern_match(PatternKind::Ua, &access.user_agent).await;
        let dangerous = self.patterns.is_dangerous(&access.user_agent, &access.url).await;

        let allowed_codes = config.codes_to_allow.clone();
        let (errors, banned) = self
            .ip_state
            .update(&access.ip, access.http_code, |code| allowed_codes.contains(&code))
            .await;

        if banned {
            return;
        }

        let decision = if dangerous {
            self.send_ban(BanRequest::automatic(
                access.ip.clone(),
                "dangerous-ua-or-url".to_string(),
                access.domain.clone(),
                access.user_agent.clone(),
                access.http_code,
                access.url.clone(),
            ))
            .await;
            "banned-dangerous"
        } else if errors >= config.max_requests {
            self.send_ban(BanRequest::automatic(
                access.ip.clone(),
                "rate-exceeded".to_string(),
                access.domain.clone(),
                access.user_agent.clone(),
                access.http_code,
                access.url.clone(),
            ))
            .await;
            "banned-rate"
        } else {
            "pass"
        };

        self.send_log(LogEvent {
            ip: access.ip,
            domain: access.domain,
            url: access.url,
            user_agent: access.user_agent,
            http_code: Some(access.http_code),
            decision,
        })
        .await;
    }

    async fn send_ban(&self, request: BanRequest) {
        if self.ban_tx.try_send(request).is_err() {
            self.metrics.ban_channel_drops.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("ban channel full, dropping request");
        }
    }

    async fn send_log(&self, event: LogEvent) {
        if self.log_tx.try_send(event).is_err() {
            self.metrics.log_channel_drops.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("log channel full, dropping event");
        }
    }
}

async fn discover_once(
    glob_pattern: &str,
    lines: &Arc<tokio::sync::Mutex<MuxedLines>>,
    known: &mut std::collections::HashSet<PathBuf>,
) {
    let Ok(paths) = glob::glob(glob_pattern) else {
        tracing::warn!(pattern = %glob_pattern, "invalid glob pattern");
        return;
    };
    for entry in paths.flatten() {
        if known.contains(&entry) {
            continue;
        }
        let mut guard = lines.lock().await;
        match guard.add_file(&entry).await {
            Ok(_) => {
                tracing::info!(file = %entry.display(), "following new log file");
                known.insert(entry);
            }
            Err(e) => tracing::debug!(file = %entry.display(), error = %e, "failed to follow file, will retry"),
        }
    }
}
