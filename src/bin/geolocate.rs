//! Standalone Geo-Lookup server (spec §4.6): a TCP request/response
//! server plus a small HTTP surface, both backed by the same in-memory
//! `GeoDataset`. Runs as a child of the Service Supervisor under the
//! "geolocate" name.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use nginx_shield::geo::{cache as geo_cache, server as geo_server, GeoService};

fn env_path(name: &str, default: impl Into<PathBuf>) -> PathBuf {
    std::env::var(name).map(PathBuf::from).unwrap_or_else(|_| default.into())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nginx_shield::logging::init();

    let data_dir = env_path("NGINX_SHIELD_DATA_DIR", "./data");
    let csv_path = env_path("NGINX_SHIELD_GEO_CSV", data_dir.join("geo.csv"));
    let cache_path = data_dir.join("geo.cache");
    let dataset = geo_cache::load_or_build(&csv_path, &cache_path).context("loading geo dataset")?;
    let favicon_path = std::env::var("NGINX_SHIELD_GEO_FAVICON").ok().map(PathBuf::from);

    let service = GeoService::new(dataset, favicon_path);

    let tcp_addr: SocketAddr = std::env::var("NGINX_SHIELD_GEO_TCP_BIND").unwrap_or_else(|_| "127.0.0.1:9090".to_string()).parse()?;
    let http_addr: SocketAddr = std::env::var("NGINX_SHIELD_GEO_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:9091".to_string()).parse()?;

    let tcp_service = service.clone();
    let tcp_task = tokio::spawn(async move { geo_server::run_tcp(tcp_service, tcp_addr).await });

    tracing::info!(%http_addr, "geo HTTP server listening");
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_task = tokio::spawn(async move { axum::serve(listener, geo_server::router(service)).await });

    tokio::select! {
        res = tcp_task => res??,
        res = http_task => res??,
    }

    Ok(())
}
