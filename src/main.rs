//! nginx-shield entrypoint: wires every subsystem from `SPEC_FULL.md`
//! §5 ("Concurrency Model") together and runs them as a set of
//! supervised background tasks behind one axum server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nginx_shield::api::{self, AppState};
use nginx_shield::auth::AuthState;
use nginx_shield::ban::store::BanStore;
use nginx_shield::ban::BanOrchestrator;
use nginx_shield::config::ConfigStore;
use nginx_shield::geo::cache as geo_cache;
use nginx_shield::ip_state::IpStateManager;
use nginx_shield::mail::Mailer;
use nginx_shield::patterns::PatternRegistry;
use nginx_shield::pipeline::{LogEvent, Pipeline, PipelineMetrics};
use nginx_shield::supervisor::{ManagedService, Supervisor};
use nginx_shield::system::SystemSampler;
use nginx_shield::whitelist::WhitelistEngine;

fn env_path(name: &str, default: impl Into<PathBuf>) -> PathBuf {
    std::env::var(name).map(PathBuf::from).unwrap_or_else(|_| default.into())
}

/// The async log sink at the end of the pipeline's data flow (spec §2
/// "... + log channel → async log writer"): every decided request,
/// structured for `RUST_LOG=nginx_shield::main=debug`-style filtering.
async fn log_writer(mut rx: tokio::sync::mpsc::Receiver<LogEvent>) {
    while let Some(event) = rx.recv().await {
        tracing::debug!(
            ip = %event.ip,
            domain = %event.domain,
            url = %event.url,
            user_agent = %event.user_agent,
            http_code = ?event.http_code,
            decision = event.decision,
            "request decided"
        );
    }
}

async fn ensure_geo_csv(path: &std::path::Path) -> anyhow::Result<()> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, b"network,asn,organization,country\n").await?;
        tracing::warn!(path = %path.display(), "no geo CSV found, starting with an empty dataset");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nginx_shield::logging::init();

    let data_dir = env_path("NGINX_SHIELD_DATA_DIR", "./data");
    tokio::fs::create_dir_all(&data_dir).await.context("creating data directory")?;

    let config = ConfigStore::load(env_path("NGINX_SHIELD_CONFIG_FILE", data_dir.join("config.json"))).await?;
    let shield_config = config.get().await;

    let patterns = PatternRegistry::load(data_dir.join("patterns")).await?;
    let whitelist = WhitelistEngine::load(data_dir.join("whitelist.json")).await?;
    let ip_state = IpStateManager::new(Duration::from_secs(shield_config.time_frame));

    let geo_csv = env_path("NGINX_SHIELD_GEO_CSV", data_dir.join("geo.csv"));
    ensure_geo_csv(&geo_csv).await?;
    let geo_cache_path = data_dir.join("geo.cache");
    let geo = Arc::new(geo_cache::load_or_build(&geo_csv, &geo_cache_path).context("loading geo dataset")?);

    let mailer = Mailer::load(data_dir.join("mail.json")).await?;

    let ban_store = BanStore::load(data_dir.join("bans.json")).await?;
    let ban_orchestrator = BanOrchestrator::new(ban_store, shield_config.jail_name.clone(), ip_state.clone(), geo.clone(), Some(mailer.clone()));

    let jwt_secret = std::env::var("NGINX_SHIELD_JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("NGINX_SHIELD_JWT_SECRET not set, using a well-known development key");
        "nginx-shield-dev-only-jwt-secret".to_string()
    });
    let auth = AuthState::load(data_dir.join("credentials.json"), &jwt_secret).await?;

    let system_sampler = SystemSampler::new(data_dir.join("system_samples.csv"), shield_config.jail_name.clone());

    // Only the geo-lookup server runs as a separately supervised child
    // process; the control plane and log pipeline live in this binary.
    let geolocate_bin = std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join("nginx-shield-geolocate")));
    let managed_services = geolocate_bin
        .map(|bin| {
            vec![ManagedService {
                name: "geolocate",
                program: bin.to_string_lossy().to_string(),
                args: vec![],
            }]
        })
        .unwrap_or_default();
    let supervisor = Supervisor::new(data_dir.join("service_commands"), managed_services).await?;

    let (ban_tx, ban_rx, log_tx, log_rx) = Pipeline::channels();
    let metrics = Arc::new(PipelineMetrics::default());
    let pipeline = Arc::new(Pipeline {
        config: config.clone(),
        patterns: patterns.clone(),
        whitelist: whitelist.clone(),
        ip_state: ip_state.clone(),
        ban_tx,
        log_tx,
        metrics: metrics.clone(),
    });

    let app_state = AppState {
        config: config.clone(),
        patterns: patterns.clone(),
        whitelist: whitelist.clone(),
        ip_state: ip_state.clone(),
        bans: ban_orchestrator.clone(),
        geo: geo.clone(),
        mailer: mailer.clone(),
        system: system_sampler.clone(),
        supervisor: supervisor.clone(),
        auth: auth.clone(),
        metrics: metrics.clone(),
    };

    // Background loops (spec §5 "Concurrency Model").
    tokio::spawn(config.clone().reload_loop());
    tokio::spawn(whitelist.clone().reload_loop(Duration::from_secs(10)));
    tokio::spawn(whitelist.clone().domain_refresh_loop(Duration::from_secs(300)));
    tokio::spawn(ip_state.clone().sweep_loop(Duration::from_secs(60)));
    tokio::spawn({
        let auth = auth.clone();
        async move { auth.totp_sessions.sweep_loop(Duration::from_secs(60)).await }
    });
    tokio::spawn(system_sampler.clone().run(Duration::from_secs(10)));
    tokio::spawn(supervisor.clone().run());
    tokio::spawn(ban_orchestrator.clone().run(ban_rx));

    let glob_pattern = format!("{}/**/*.log", shield_config.log_dir.trim_end_matches('/'));
    tokio::spawn(pipeline.run(glob_pattern));
    tokio::spawn(log_writer(log_rx));

    let addr: SocketAddr = std::env::var("NGINX_SHIELD_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()).parse()?;
    tracing::info!(%addr, "nginx-shield control-plane API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, api::router(app_state)).await?;

    Ok(())
}
