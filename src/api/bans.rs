//! Ban resource handlers (spec §4.7 "Bans"): paged listing with
//! per-kind offsets and CSV export, manual ban/unban, stats/counts,
//! fail2ban status, geo enrichment, and the CIDR sweep trio.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::auth::AuthenticatedUser;
use crate::ban::store::{AutomaticBan, ManualBan};
use crate::ban::BanKind;
use crate::errors::{AppError, AppResult};

const MAX_BULK_MANUAL: usize = 20;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    automatic_offset: usize,
    #[serde(default)]
    manual_offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    format: Option<String>,
}

fn default_limit() -> usize {
    50
}

#[derive(Serialize)]
struct ListResponse {
    success: bool,
    automatic: Vec<AutomaticBan>,
    manual: Vec<ManualBan>,
    total_automatic: usize,
    total_manual: usize,
    has_more_automatic: bool,
    has_more_manual: bool,
}

fn matches_search(ip: &str, reason_or_domain: &str, query: &str) -> bool {
    let q = query.to_lowercase();
    ip.to_lowercase().contains(&q) || reason_or_domain.to_lowercase().contains(&q)
}

/// spec §4.7 "Bans: list (paged, per-kind offsets, search, CSV/JSON
/// export)"; "Export mode overrides limit" (export/csv dumps everything).
pub async fn list(State(state): State<AppState>, Query(q): Query<ListQuery>) -> AppResult<Response> {
    let mut automatic = state.bans.store().list_automatic().await;
    let mut manual = state.bans.store().list_manual().await;

    if let Some(search) = &q.search {
        automatic.retain(|r| matches_search(&r.ip, &r.domain, search));
        manual.retain(|r| matches_search(&r.ip_or_cidr, &r.reason, search));
    }

    let total_automatic = automatic.len();
    let total_manual = manual.len();

    let exporting = q.format.as_deref() == Some("csv") || q.format.as_deref() == Some("export");
    if exporting {
        return Ok(export_csv(&automatic, &manual));
    }

    let has_more_automatic = q.automatic_offset + q.limit < total_automatic;
    let has_more_manual = q.manual_offset + q.limit < total_manual;
    let automatic = automatic.into_iter().skip(q.automatic_offset).take(q.limit).collect();
    let manual = manual.into_iter().skip(q.manual_offset).take(q.limit).collect();

    Ok(Json(ListResponse {
        success: true,
        automatic,
        manual,
        total_automatic,
        total_manual,
        has_more_automatic,
        has_more_manual,
    })
    .into_response())
}

fn export_csv(automatic: &[AutomaticBan], manual: &[ManualBan]) -> Response {
    let mut out = String::from("kind,ip_or_cidr,reason_or_domain,timestamp,network,asn,organization,country\n");
    for row in automatic {
        out.push_str(&format!(
            "automatic,{},{},{},{},{},{},{}\n",
            row.ip,
            row.domain,
            row.ban_timestamp,
            row.network.clone().unwrap_or_default(),
            row.asn.clone().unwrap_or_default(),
            row.organization.clone().unwrap_or_default(),
            row.country.clone().unwrap_or_default(),
        ));
    }
    for row in manual {
        out.push_str(&format!(
            "manual,{},{},{},{},{},{},{}\n",
            row.ip_or_cidr,
            row.reason,
            row.ban_timestamp,
            row.network.clone().unwrap_or_default(),
            row.asn.clone().unwrap_or_default(),
            row.organization.clone().unwrap_or_default(),
            row.country.clone().unwrap_or_default(),
        ));
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/csv")],
        out,
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct ManualBanRequest {
    ip_or_cidr: String,
    reason: String,
}

pub async fn manual_ban(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Json(req): Json<ManualBanRequest>,
) -> AppResult<Json<ManualBan>> {
    let row = state.bans.ban_manual(req.ip_or_cidr, req.reason).await?;
    Ok(Json(row))
}

#[derive(Deserialize)]
pub struct UnbanRequest {
    ip_or_cidr: String,
    kind: String,
}

pub async fn unban(State(state): State<AppState>, _user: AuthenticatedUser, Json(req): Json<UnbanRequest>) -> AppResult<Json<serde_json::Value>> {
    let kind = match req.kind.as_str() {
        "automatic" => BanKind::Automatic,
        "manual" => BanKind::Manual,
        other => return Err(AppError::validation(format!("unknown ban kind: {other}"))),
    };
    state.bans.unban(&req.ip_or_cidr, kind).await?;
    Ok(Json(json!({"success": true})))
}

pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (automatic_count, manual_count) = state.bans.store().counts().await;
    let top_offenders = state.ip_state.top_offenders(10).await;
    Json(json!({
        "success": true,
        "automatic_count": automatic_count,
        "manual_count": manual_count,
        "tracked_ips": state.ip_state.len().await,
        "top_offenders": top_offenders,
    }))
}

pub async fn counts(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (automatic_count, manual_count) = state.bans.store().counts().await;
    Json(json!({"success": true, "automatic_count": automatic_count, "manual_count": manual_count}))
}

pub async fn fail2ban_status(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let status = state.bans.fail2ban_status().await?;
    let alive = state.bans.fail2ban_ping().await;
    Ok(Json(json!({"success": true, "alive": alive, "status": status})))
}

pub async fn geo_info(State(state): State<AppState>, Path(ip): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let parsed = ip.parse::<std::net::IpAddr>().map_err(|_| AppError::validation(format!("invalid IP: {ip}")))?;
    match state.bans.geo().lookup(parsed) {
        Some(result) => Ok(Json(json!({
            "success": true,
            "ip": ip,
            "network": result.row.network,
            "asn": result.row.asn,
            "organization": result.row.organization,
            "country": result.row.country,
            "prefix_len": result.prefix_len,
        }))),
        None => Ok(Json(json!({"success": false, "ip": ip, "message": "no geo data for this address"}))),
    }
}

pub async fn check_status(State(state): State<AppState>, Path(ip): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let automatic = state.bans.store().list_automatic().await;
    let manual = state.bans.store().list_manual().await;
    if let Some(row) = automatic.iter().find(|r| r.ip == ip) {
        return Ok(Json(json!({"success": true, "banned": true, "kind": "automatic", "ban": row})));
    }
    if let Some(row) = manual.iter().find(|r| r.ip_or_cidr == ip) {
        return Ok(Json(json!({"success": true, "banned": true, "kind": "manual", "ban": row})));
    }
    let parsed = ip.parse::<std::net::IpAddr>().ok();
    if let Some(ip_addr) = parsed {
        if let Some(cidr) = state.bans.store().is_ip_in_any_cidr(ip_addr).await {
            return Ok(Json(json!({"success": true, "banned": true, "kind": "cidr", "cidr": cidr})));
        }
    }
    Ok(Json(json!({"success": true, "banned": false})))
}

#[derive(Deserialize)]
pub struct BulkManualEntry {
    ip_or_cidr: String,
    reason: String,
}

#[derive(Deserialize)]
pub struct BulkManualRequest {
    entries: Vec<BulkManualEntry>,
}

/// spec supplement "Bulk-manual ban cap of 20" (`ip_manager.py`):
/// caps the batch, reports per-entry success/failure without aborting.
pub async fn bulk_manual(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Json(req): Json<BulkManualRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if req.entries.len() > MAX_BULK_MANUAL {
        return Err(AppError::validation(format!("bulk-manual accepts at most {MAX_BULK_MANUAL} entries, got {}", req.entries.len())));
    }
    let mut succeeded = Vec::new();
    let mut failed: HashMap<String, String> = HashMap::new();
    for entry in req.entries {
        match state.bans.ban_manual(entry.ip_or_cidr.clone(), entry.reason).await {
            Ok(row) => succeeded.push(row),
            Err(e) => {
                failed.insert(entry.ip_or_cidr, e.to_string());
            }
        }
    }
    Ok(Json(json!({"success": true, "banned": succeeded, "failed": failed})))
}

#[derive(Deserialize)]
pub struct CidrRequest {
    cidr: String,
}

pub async fn cidr_check_ips(State(state): State<AppState>, Json(req): Json<CidrRequest>) -> AppResult<Json<serde_json::Value>> {
    let cidr: IpNetwork = req.cidr.parse().map_err(|_| AppError::validation(format!("invalid CIDR: {}", req.cidr)))?;
    let ips = state.bans.ips_in_cidr(cidr).await;
    Ok(Json(json!({"success": true, "cidr": req.cidr, "ips": ips})))
}

pub async fn cidr_unban_ips(State(state): State<AppState>, _user: AuthenticatedUser, Json(req): Json<CidrRequest>) -> AppResult<Json<serde_json::Value>> {
    let cidr: IpNetwork = req.cidr.parse().map_err(|_| AppError::validation(format!("invalid CIDR: {}", req.cidr)))?;
    let unbanned = state.bans.unban_ips_in_cidr(cidr).await;
    Ok(Json(json!({"success": true, "cidr": req.cidr, "unbanned": unbanned})))
}

#[derive(Deserialize)]
pub struct CidrBanEntry {
    cidr: String,
    reason: String,
}

#[derive(Deserialize)]
pub struct CidrBanMultipleRequest {
    entries: Vec<CidrBanEntry>,
}

pub async fn cidr_ban_multiple(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Json(req): Json<CidrBanMultipleRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let entries = req.entries.into_iter().map(|e| (e.cidr, e.reason)).collect();
    let (total_unbanned, created) = state.bans.ban_multiple_cidrs(entries).await?;
    Ok(Json(json!({"success": true, "ips_unbanned": total_unbanned, "bans": created})))
}
