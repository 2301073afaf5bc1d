//! Geo TCP and HTTP surfaces (spec §4.6, §6 "Geo TCP protocol").

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::data::GeoDataset;

pub struct GeoService {
    dataset: GeoDataset,
    favicon_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct LookupResponse {
    success: bool,
    ip: String,
    result: Option<ResultRow>,
    asn_cidrs: Vec<String>,
    query_time_seconds: f64,
}

#[derive(Serialize)]
struct ResultRow {
    network: String,
    asn: String,
    organization: String,
    country: String,
}

#[derive(Deserialize)]
struct TcpRequest {
    action: String,
    ip: Option<String>,
}

impl GeoService {
    pub fn new(dataset: GeoDataset, favicon_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self { dataset, favicon_path })
    }

    fn lookup_json(&self, ip_str: &str) -> Value {
        let start = Instant::now();
        let Ok(ip) = ip_str.parse::<std::net::IpAddr>() else {
            return json!({"success": false, "ip": ip_str, "message": "invalid IP address"});
        };
        let result = self.dataset.lookup(ip);
        let asn_cidrs = result
            .as_ref()
            .map(|r| self.dataset.asn_networks(&r.row.asn))
            .unwrap_or_default();
        let response = LookupResponse {
            success: result.is_some(),
            ip: ip_str.to_string(),
            result: result.map(|r| ResultRow {
                network: r.row.network,
                asn: r.row.asn,
                organization: r.row.organization,
                country: r.row.country,
            }),
            asn_cidrs,
            query_time_seconds: start.elapsed().as_secs_f64(),
        };
        serde_json::to_value(response).unwrap()
    }

    fn stats_json(&self) -> Value {
        json!({
            "success": true,
            "rows": self.dataset.row_count(),
            "asn_count": self.dataset.asn_count(),
            "schema_version": super::data::SCHEMA_VERSION,
        })
    }

    fn handle_request(&self, req: &TcpRequest) -> Value {
        match req.action.as_str() {
            "lookup" => match &req.ip {
                Some(ip) => self.lookup_json(ip),
                None => json!({"success": false, "message": "missing ip"}),
            },
            "stats" => self.stats_json(),
            other => json!({"success": false, "message": format!("unknown action: {other}")}),
        }
    }
}

/// Spec §4.6 "TCP": newline-less JSON request -> newline-less JSON
/// response over a single connection; client half-closes after writing,
/// server reads to EOF then replies and closes.
pub async fn run_tcp(service: Arc<GeoService>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "geo TCP server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_connection(service, stream).await {
                tracing::debug!(%peer, error = %e, "geo TCP connection error");
            }
        });
    }
}

async fn handle_tcp_connection(service: Arc<GeoService>, mut stream: TcpStream) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = match serde_json::from_slice::<TcpRequest>(&buf) {
        Ok(req) => service.handle_request(&req),
        Err(_) => json!({"success": false, "message": "invalid request"}),
    };
    stream.write_all(&serde_json::to_vec(&response)?).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn http_lookup(State(service): State<Arc<GeoService>>, AxumPath(ip): AxumPath<String>) -> impl IntoResponse {
    if ip.parse::<std::net::IpAddr>().is_err() {
        return (StatusCode::BAD_REQUEST, Json(json!({"success": false, "message": "invalid IP"}))).into_response();
    }
    let body = service.lookup_json(&ip);
    let status = if body.get("success").and_then(Value::as_bool) == Some(true) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(body)).into_response()
}

async fn http_favicon(State(service): State<Arc<GeoService>>) -> impl IntoResponse {
    match &service.favicon_path {
        Some(path) => match tokio::fs::read(path).await {
            Ok(bytes) => (StatusCode::OK, bytes).into_response(),
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router(service: Arc<GeoService>) -> Router {
    Router::new()
        .route("/favicon.ico", get(http_favicon))
        .route("/{ip}", get(http_lookup))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::data::GeoDataset;
    use std::io::Write;

    fn dataset() -> GeoDataset {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network,asn,organization,country").unwrap();
        writeln!(file, "10.0.0.0/8,AS1,Org1,US").unwrap();
        GeoDataset::from_csv(file.path()).unwrap()
    }

    #[test]
    fn lookup_json_reports_hit_and_miss() {
        let service = GeoService::new(dataset(), None);
        let hit = service.lookup_json("10.1.2.3");
        assert_eq!(hit["success"], json!(true));
        let miss = service.lookup_json("192.0.2.1");
        assert_eq!(miss["success"], json!(false));
    }

    #[test]
    fn stats_reports_counts() {
        let service = GeoService::new(dataset(), None);
        let stats = service.stats_json();
        assert_eq!(stats["rows"], json!(1));
        assert_eq!(stats["asn_count"], json!(1));
    }
}
