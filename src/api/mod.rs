//! Control-Plane HTTP API (spec §4.7, §4.8): the administrative surface
//! over every store and subsystem, built with `axum` the way
//! `tezcatlipoca-auth` wires its router — a cloneable `AppState` of
//! `Arc`s, one module per resource, `AppError` doing the status-code
//! translation at the edge.

pub mod auth;
pub mod bans;
pub mod config;
pub mod logs;
pub mod patterns;
pub mod services;
pub mod system;
pub mod whitelist;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{FromRef, Request, State};
use axum::http::header::SET_COOKIE;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use axum_extra::extract::CookieJar;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::session::SESSION_COOKIE_NAME;
use crate::auth::{AuthState, AuthenticatedUser};
use crate::ban::BanOrchestrator;
use crate::config::ConfigStore;
use crate::geo::GeoDataset;
use crate::ip_state::IpStateManager;
use crate::mail::Mailer;
use crate::patterns::PatternRegistry;
use crate::pipeline::PipelineMetrics;
use crate::supervisor::Supervisor;
use crate::system::SystemSampler;
use crate::whitelist::WhitelistEngine;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub patterns: Arc<PatternRegistry>,
    pub whitelist: Arc<WhitelistEngine>,
    pub ip_state: Arc<IpStateManager>,
    pub bans: Arc<BanOrchestrator>,
    pub geo: Arc<GeoDataset>,
    pub mailer: Arc<Mailer>,
    pub system: Arc<SystemSampler>,
    pub supervisor: Arc<Supervisor>,
    pub auth: Arc<AuthState>,
    pub metrics: Arc<PipelineMetrics>,
}

impl FromRef<AppState> for Arc<AuthState> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// Enforces spec §4.7 "every non-public endpoint requires a valid
/// session token" as a layer over the whole protected router, rather
/// than relying on each handler remembering to take an
/// `AuthenticatedUser` parameter.
async fn require_auth(user: Result<AuthenticatedUser, crate::errors::AppError>, request: Request, next: Next) -> Response {
    match user {
        Ok(_) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Rolling session (spec §4.8): on every authenticated request, if the
/// `sid` cookie's remaining lifetime is under the reissue threshold,
/// mint a fresh token and set it on the response. Runs as a layer over
/// the protected router rather than inside `AuthenticatedUser`, since an
/// extractor has no way to attach a response header.
async fn reissue_session(State(auth): State<Arc<AuthState>>, jar: CookieJar, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;

    let Some(cookie) = jar.get(SESSION_COOKIE_NAME) else {
        return response;
    };
    let Ok(claims) = auth.sessions.verify(cookie.value()) else {
        return response;
    };
    let Ok(Some(new_token)) = auth.sessions.reissue_if_expiring(&claims) else {
        return response;
    };

    let secure = auth.secure_cookies.load(Ordering::Relaxed);
    let fresh = auth.sessions.cookie(new_token, secure);
    if let Ok(value) = HeaderValue::from_str(&fresh.to_string()) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/login/verify-totp", post(auth::verify_totp))
        .route("/api/auth/login/verify-backup-codes", post(auth::verify_backup_codes));

    let protected = Router::new()
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/password", put(auth::change_password))
        .route("/api/auth/totp/setup", post(auth::totp_setup))
        .route("/api/auth/totp/confirm", post(auth::totp_confirm))
        .route("/api/auth/totp/disable", post(auth::totp_disable))
        .route("/api/auth/totp/backup-codes", post(auth::regenerate_backup_codes))
        .route("/api/bans", get(bans::list).post(bans::manual_ban))
        .route("/api/bans/unban", post(bans::unban))
        .route("/api/bans/stats", get(bans::stats))
        .route("/api/bans/counts", get(bans::counts))
        .route("/api/bans/fail2ban-status", get(bans::fail2ban_status))
        .route("/api/bans/geo-info/{ip}", get(bans::geo_info))
        .route("/api/bans/check-status/{ip}", get(bans::check_status))
        .route("/api/bans/bulk-manual", post(bans::bulk_manual))
        .route("/api/bans/cidr/check-ips", post(bans::cidr_check_ips))
        .route("/api/bans/cidr/unban-ips", post(bans::cidr_unban_ips))
        .route("/api/bans/cidr/ban-multiple", post(bans::cidr_ban_multiple))
        .route("/api/whitelist", get(whitelist::list).post(whitelist::add))
        .route("/api/whitelist/search", get(whitelist::search))
        .route("/api/whitelist/stats", get(whitelist::stats))
        .route("/api/whitelist/metadata", get(whitelist::metadata))
        .route("/api/whitelist/{id}", put(whitelist::update).delete(whitelist::remove))
        .route("/api/patterns/{kind}", get(patterns::list).post(patterns::add))
        .route("/api/patterns", get(patterns::list_all))
        .route("/api/patterns/{kind}/stats", get(patterns::stats))
        .route("/api/patterns/{kind}/{id}", put(patterns::update).delete(patterns::remove))
        .route("/api/config", get(config::get_config).put(config::replace_config))
        .route("/api/config/mail", get(config::get_mail_config).put(config::replace_mail_config))
        .route("/api/config/secure", get(config::get_secure_config).put(config::set_secure_config))
        .route("/api/system/live", get(system::live))
        .route("/api/system/historical", get(system::historical))
        .route("/api/logs/files", get(logs::files))
        .route("/api/logs/tail", get(logs::tail))
        .route("/api/logs/stats", get(logs::stats))
        .route("/api/logs/search", get(logs::search))
        .route("/api/services/request-restart/{service}", post(services::request_restart))
        .route("/api/services/restart-status/{service}", get(services::restart_status))
        .route("/api/services/pending-restarts", get(services::pending_restarts))
        .layer(middleware::from_fn_with_state(state.auth.clone(), reissue_session))
        .layer(middleware::from_fn_with_state(state.auth.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
