//! Service Supervisor (spec §4.9): sentinel-file driven restart of the
//! system's own child processes.
//!
//! Grounded on `service_manager.py`'s sentinel-file contract; the watch
//! loop and SIGTERM/grace/SIGKILL sequence use `anyhow` errors and
//! `tracing` throughout, matching the rest of this crate's subprocess
//! handling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

pub const VALID_SERVICES: [&str; 4] = ["backend", "frontend", "analyzer", "geolocate"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSentinel {
    pub service: String,
    pub timestamp: String,
    pub command: String,
    pub status: String,
}

pub struct ManagedService {
    pub name: &'static str,
    pub program: String,
    pub args: Vec<String>,
}

struct Running {
    child: Child,
}

pub struct Supervisor {
    commands_dir: PathBuf,
    services: Vec<ManagedService>,
    running: Mutex<HashMap<String, Running>>,
}

impl Supervisor {
    pub async fn new(commands_dir: impl Into<PathBuf>, services: Vec<ManagedService>) -> anyhow::Result<Arc<Self>> {
        let commands_dir = commands_dir.into();
        tokio::fs::create_dir_all(&commands_dir).await?;
        Ok(Arc::new(Self {
            commands_dir,
            services,
            running: Mutex::new(HashMap::new()),
        }))
    }

    fn sentinel_path(&self, service: &str) -> PathBuf {
        self.commands_dir.join(format!("{service}.restart"))
    }

    pub fn is_valid_service(service: &str) -> bool {
        VALID_SERVICES.contains(&service)
    }

    pub async fn request_restart(&self, service: &str) -> anyhow::Result<()> {
        anyhow::ensure!(Self::is_valid_service(service), "unknown service: {service}");
        let sentinel = RestartSentinel {
            service: service.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            command: "restart".to_string(),
            status: "pending".to_string(),
        };
        tokio::fs::write(self.sentinel_path(service), serde_json::to_vec_pretty(&sentinel)?).await?;
        Ok(())
    }

    pub async fn restart_status(&self, service: &str) -> anyhow::Result<RestartSentinel> {
        anyhow::ensure!(Self::is_valid_service(service), "unknown service: {service}");
        let path = self.sentinel_path(service);
        if !path.exists() {
            return Ok(RestartSentinel {
                service: service.to_string(),
                timestamp: Utc::now().to_rfc3339(),
                command: "restart".to_string(),
                status: "ready".to_string(),
            });
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub async fn all_pending_restarts(&self) -> Vec<String> {
        let mut pending = Vec::new();
        for service in VALID_SERVICES {
            if self.sentinel_path(service).exists() {
                pending.push(service.to_string());
            }
        }
        pending
    }

    /// spec §4.9 "Supervisor loop polls every ~1 s": on sentinel
    /// presence, terminate (SIGTERM, 5 s grace, SIGKILL), respawn,
    /// remove the sentinel.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            for service in &self.services {
                let path = self.sentinel_path(service.name);
                if !path.exists() {
                    continue;
                }
                if let Err(e) = self.restart_one(service).await {
                    tracing::error!(service = service.name, error = %e, "restart failed");
                }
                tokio::fs::remove_file(&path).await.ok();
            }
        }
    }

    async fn restart_one(&self, service: &ManagedService) -> anyhow::Result<()> {
        tracing::info!(service = service.name, "restarting service");
        self.terminate(service.name).await?;
        self.spawn(service).await
    }

    async fn terminate(&self, name: &str) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        let Some(entry) = running.get_mut(name) else {
            return Ok(());
        };
        if let Some(pid) = entry.child.id() {
            send_sigterm(pid);
        }
        let graceful = tokio::time::timeout(Duration::from_secs(5), entry.child.wait()).await;
        if graceful.is_err() {
            entry.child.kill().await.ok();
        }
        running.remove(name);
        Ok(())
    }

    async fn spawn(&self, service: &ManagedService) -> anyhow::Result<()> {
        let child = Command::new(&service.program).args(&service.args).spawn()?;
        self.running.lock().await.insert(service.name.to_string(), Running { child });
        Ok(())
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_then_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path(), Vec::new()).await.unwrap();
        assert_eq!(supervisor.restart_status("backend").await.unwrap().status, "ready");
        supervisor.request_restart("backend").await.unwrap();
        assert_eq!(supervisor.restart_status("backend").await.unwrap().status, "pending");
        assert_eq!(supervisor.all_pending_restarts().await, vec!["backend"]);
    }

    #[tokio::test]
    async fn unknown_service_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path(), Vec::new()).await.unwrap();
        assert!(supervisor.request_restart("nope").await.is_err());
    }
}
