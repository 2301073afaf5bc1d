//! IP State Manager (spec §4.3).
//!
//! A single mutex-guarded map from IP to sliding-window error state, with
//! a hard capacity bound and emergency eviction, mirroring the corpus
//! pattern of "one mutex, all mutations and reads go through it"
//! (spec §5) rather than a lock-free map — the invariants here (window
//! reset observably zeroes `errors` at most once per window) need atomic
//! read-modify-write across the whole record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct IpState {
    pub errors: u32,
    pub window_start: Instant,
    pub last_seen: Instant,
    pub banned: bool,
    pub total_requests: u64,
    pub created_at: Instant,
}

impl IpState {
    fn new(now: Instant) -> Self {
        Self {
            errors: 0,
            window_start: now,
            last_seen: now,
            banned: false,
            total_requests: 0,
            created_at: now,
        }
    }
}

struct Inner {
    entries: HashMap<String, IpState>,
}

pub struct IpStateManager {
    inner: Mutex<Inner>,
    max_entries: usize,
    time_frame: Duration,
    inactivity_threshold: Duration,
}

impl IpStateManager {
    pub fn new(time_frame: Duration) -> Arc<Self> {
        Self::with_bounds(time_frame, DEFAULT_MAX_ENTRIES, DEFAULT_INACTIVITY_THRESHOLD)
    }

    pub fn with_bounds(time_frame: Duration, max_entries: usize, inactivity_threshold: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
            }),
            max_entries,
            time_frame,
            inactivity_threshold,
        })
    }

    /// spec §4.1 step 5 / §4.3: update on observing a request, return
    /// (errors, banned) after any window reset.
    pub async fn update(&self, ip: &str, http_code: u16, allowed: impl Fn(u16) -> bool) -> (u32, bool) {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;

        if !guard.entries.contains_key(ip) && guard.entries.len() >= self.max_entries {
            Self::emergency_evict(&mut guard.entries);
        }

        let entry = guard
            .entries
            .entry(ip.to_string())
            .or_insert_with(|| IpState::new(now));

        if now.duration_since(entry.window_start) > self.time_frame {
            entry.errors = 0;
            entry.window_start = now;
            entry.banned = false;
        }

        entry.last_seen = now;
        entry.total_requests += 1;
        if !allowed(http_code) {
            entry.errors += 1;
        }

        (entry.errors, entry.banned)
    }

    fn emergency_evict(entries: &mut HashMap<String, IpState>) {
        let target = (entries.len() * 4) / 5; // drop oldest 20%
        let mut by_last_seen: Vec<(String, Instant)> =
            entries.iter().map(|(ip, s)| (ip.clone(), s.last_seen)).collect();
        by_last_seen.sort_by_key(|(_, last_seen)| *last_seen);
        let to_remove = by_last_seen.len().saturating_sub(target);
        for (ip, _) in by_last_seen.into_iter().take(to_remove) {
            entries.remove(&ip);
        }
        tracing::warn!(removed = to_remove, "IP state manager at capacity, emergency eviction");
    }

    pub async fn mark_banned(&self, ip: &str) {
        if let Some(entry) = self.inner.lock().await.entries.get_mut(ip) {
            entry.banned = true;
        }
    }

    pub async fn forget(&self, ip: &str) {
        self.inner.lock().await.entries.remove(ip);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn top_offenders(&self, n: usize) -> Vec<(String, u32)> {
        let guard = self.inner.lock().await;
        let mut all: Vec<(String, u32)> = guard.entries.iter().map(|(ip, s)| (ip.clone(), s.errors)).collect();
        all.sort_by(|a, b| b.1.cmp(&a.1));
        all.truncate(n);
        all
    }

    /// spec §4.3 sweep: drop inactive entries and clean entries older
    /// than 2x the window, in batches of 100 with a yield between
    /// batches so the sweep never holds the lock for long.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let ips: Vec<String> = {
            let guard = self.inner.lock().await;
            guard.entries.keys().cloned().collect()
        };
        for batch in ips.chunks(100) {
            let mut guard = self.inner.lock().await;
            for ip in batch {
                if let Some(state) = guard.entries.get(ip) {
                    let inactive = now.duration_since(state.last_seen) > self.inactivity_threshold;
                    let stale_clean = state.errors == 0
                        && !state.banned
                        && now.duration_since(state.created_at) > self.time_frame * 2;
                    if inactive || stale_clean {
                        guard.entries.remove(ip);
                    }
                }
            }
            drop(guard);
            tokio::task::yield_now().await;
        }
    }

    /// Background loop: sweep periodically (spec §5 "Sweepers").
    pub async fn sweep_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(code: u16) -> bool {
        matches!(code, 200 | 301 | 302 | 304)
    }

    #[tokio::test]
    async fn errors_counts_only_disallowed_codes() {
        let mgr = IpStateManager::new(Duration::from_secs(3600));
        let (e1, b1) = mgr.update("1.2.3.4", 200, allowed).await;
        assert_eq!((e1, b1), (0, false));
        let (e2, _) = mgr.update("1.2.3.4", 404, allowed).await;
        assert_eq!(e2, 1);
        let (e3, _) = mgr.update("1.2.3.4", 404, allowed).await;
        assert_eq!(e3, 2);
    }

    #[tokio::test]
    async fn window_reset_zeroes_errors_once() {
        let mgr = IpStateManager::new(Duration::from_millis(10));
        mgr.update("5.5.5.5", 404, allowed).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (errors, banned) = mgr.update("5.5.5.5", 200, allowed).await;
        assert_eq!(errors, 0);
        assert!(!banned);
    }

    #[tokio::test]
    async fn forget_then_fresh_window() {
        let mgr = IpStateManager::new(Duration::from_secs(3600));
        mgr.update("9.9.9.9", 404, allowed).await;
        mgr.mark_banned("9.9.9.9").await;
        mgr.forget("9.9.9.9").await;
        let (errors, banned) = mgr.update("9.9.9.9", 404, allowed).await;
        assert_eq!(errors, 1);
        assert!(!banned);
    }

    #[tokio::test]
    async fn emergency_eviction_keeps_size_bounded() {
        let mgr = IpStateManager::with_bounds(Duration::from_secs(3600), 10, Duration::from_secs(3600));
        for i in 0..10 {
            mgr.update(&format!("10.0.0.{i}"), 200, allowed).await;
        }
        assert_eq!(mgr.len().await, 10);
        mgr.update("10.0.0.99", 200, allowed).await;
        assert!(mgr.len().await <= 8);
    }

    #[tokio::test]
    async fn top_offenders_orders_by_errors() {
        let mgr = IpStateManager::new(Duration::from_secs(3600));
        mgr.update("1.1.1.1", 404, allowed).await;
        mgr.update("2.2.2.2", 404, allowed).await;
        mgr.update("2.2.2.2", 404, allowed).await;
        let top = mgr.top_offenders(1).await;
        assert_eq!(top[0].0, "2.2.2.2");
        assert_eq!(top[0].1, 2);
    }
}
