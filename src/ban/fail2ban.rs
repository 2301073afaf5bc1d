//! `fail2ban-client` subprocess wrapper (spec §6 "fail2ban-client CLI").
//!
//! Spawns the subprocess, captures output, and maps a non-zero exit to
//! an error, targeting `fail2ban-client` instead of ipset/iptables, with
//! a 30 s timeout around every invocation.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::{AppError, AppResult};

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Fail2Ban {
    jail: String,
}

impl Fail2Ban {
    pub fn new(jail: impl Into<String>) -> Self {
        Self { jail: jail.into() }
    }

    /// `fail2ban-client set <jail> banip <ip_or_cidr>`. Exit 0 and stdout
    /// `"1"` indicate success.
    pub async fn ban(&self, ip_or_cidr: &str) -> AppResult<bool> {
        self.run(&["set", &self.jail, "banip", ip_or_cidr]).await
    }

    /// Best-effort unban; callers should log but not fail a request on
    /// error (spec §4.5 "Unban... best-effort").
    pub async fn unban(&self, ip_or_cidr: &str) -> AppResult<bool> {
        self.run(&["set", &self.jail, "unbanip", ip_or_cidr]).await
    }

    pub async fn status(&self) -> AppResult<String> {
        self.run_raw(&["status", &self.jail]).await
    }

    pub async fn ping(&self) -> bool {
        self.run_raw(&["ping"]).await.map(|out| out.trim() == "Server replied: pong").unwrap_or(false)
    }

    async fn run(&self, args: &[&str]) -> AppResult<bool> {
        let stdout = self.run_raw(args).await?;
        Ok(stdout.trim() == "1")
    }

    async fn run_raw(&self, args: &[&str]) -> AppResult<String> {
        let output = timeout(SUBPROCESS_TIMEOUT, Command::new("fail2ban-client").args(args).output())
            .await
            .map_err(|_| AppError::Firewall(format!("fail2ban-client {} timed out", args.join(" "))))?
            .map_err(|e| AppError::Firewall(format!("failed to spawn fail2ban-client: {e}")))?;

        if !output.status.success() {
            return Err(AppError::Firewall(format!(
                "fail2ban-client {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
