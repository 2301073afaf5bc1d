//! Auth surface handlers (spec §4.8): login/TOTP/backup-code flows,
//! password change, and the TOTP setup/confirm/disable lifecycle.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::auth::credentials::{generate_recovery_password, CredentialsStore};
use crate::auth::{crypto, totp, AuthenticatedUser};
use crate::errors::{AppError, AppResult, AuthError};

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
pub struct VerifyTotpRequest {
    username: String,
    totp_code: String,
}

#[derive(Deserialize)]
pub struct VerifyBackupCodesRequest {
    username: String,
    codes: Vec<String>,
}

#[derive(Deserialize)]
pub struct PasswordChangeRequest {
    current_password: String,
    new_username: Option<String>,
    new_password: Option<String>,
}

#[derive(Deserialize)]
pub struct TotpSetupRequest {
    current_password: String,
}

#[derive(Serialize)]
struct TotpSetupResponse {
    success: bool,
    secret: String,
    qr_code_data_uri: String,
}

#[derive(Deserialize)]
pub struct TotpCodeRequest {
    totp_code: String,
}

#[derive(Deserialize)]
pub struct TotpDisableRequest {
    current_password: String,
    totp_code: String,
}

fn session_response(state: &AppState, username: &str, requires_password_change: bool, mut body: serde_json::Value) -> AppResult<Response> {
    let token = state.auth.sessions.mint(username, requires_password_change)?;
    let secure = state.auth.secure_cookies.load(Ordering::Relaxed);
    let cookie = state.auth.sessions.cookie(token, secure);
    let jar = CookieJar::new().add(cookie);
    body["success"] = json!(true);
    body["username"] = json!(username);
    body["requires_password_change"] = json!(requires_password_change);
    Ok((jar, Json(body)).into_response())
}

async fn require_current_password(state: &AppState, username: &str, current_password: &str) -> AppResult<crate::auth::credentials::Credentials> {
    let user = state
        .auth
        .credentials
        .find_by_username(username)
        .await
        .ok_or(AppError::Auth(AuthError::InvalidCredentials))?;
    if !CredentialsStore::verify_password(current_password, &user.password_hash) {
        return Err(AppError::Auth(AuthError::InvalidCredentials));
    }
    Ok(user)
}

/// spec §4.8 "Login flow with TOTP": invalid creds -> 401, TOTP-enabled
/// user -> 422 with `{requires_totp:true}`, else a minted session.
pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> AppResult<Response> {
    let outcome = state.auth.credentials.verify_credentials(&req.username, &req.password).await;
    if outcome.requires_totp {
        let body = json!({"success": false, "requires_totp": true});
        return Ok((axum::http::StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response());
    }
    if !outcome.authenticated {
        return Err(AppError::Auth(AuthError::InvalidCredentials));
    }
    let username = outcome.username.unwrap_or(req.username);
    session_response(&state, &username, outcome.requires_password_change, json!({}))
}

pub async fn verify_totp(State(state): State<AppState>, Json(req): Json<VerifyTotpRequest>) -> AppResult<Response> {
    let user = state
        .auth
        .credentials
        .find_by_username(&req.username)
        .await
        .ok_or(AppError::Auth(AuthError::InvalidCredentials))?;
    if !user.totp_enabled {
        return Err(AppError::Auth(AuthError::InvalidCredentials));
    }
    let secret_encrypted = user.totp_secret_encrypted.as_deref().ok_or(AppError::Auth(AuthError::InvalidTotp))?;
    let secret = crypto::decrypt(secret_encrypted)?;
    if !totp::verify_code(&req.username, &secret, &req.totp_code) {
        return Err(AppError::Auth(AuthError::InvalidTotp));
    }
    session_response(&state, &req.username, user.requires_password_change, json!({}))
}

/// spec §4.8 "Backup-code recovery": a full match disables TOTP, issues
/// a one-time 12-char recovery password, and forces a password change.
pub async fn verify_backup_codes(State(state): State<AppState>, Json(req): Json<VerifyBackupCodesRequest>) -> AppResult<Response> {
    let user = state
        .auth
        .credentials
        .find_by_username(&req.username)
        .await
        .ok_or(AppError::Auth(AuthError::InvalidCredentials))?;
    let stored_encrypted = user.backup_codes_encrypted.as_deref().ok_or(AppError::Auth(AuthError::InvalidBackupCodes))?;
    let stored_json = crypto::decrypt(stored_encrypted)?;
    let stored: Vec<String> = serde_json::from_str(&stored_json).map_err(|e| AppError::Store(e.to_string()))?;
    totp::verify_backup_codes(&req.codes, &stored)?;

    let recovery_password = generate_recovery_password();
    let hash = CredentialsStore::hash_password(&recovery_password)?;
    state.auth.credentials.clear_totp(&req.username).await?;
    state.auth.credentials.replace_password(&req.username, hash).await?;

    session_response(&state, &req.username, true, json!({"new_password": recovery_password}))
}

pub async fn logout(State(state): State<AppState>) -> Response {
    let secure = state.auth.secure_cookies.load(Ordering::Relaxed);
    let jar = CookieJar::new().add(state.auth.sessions.expired_cookie(secure));
    (jar, Json(json!({"success": true}))).into_response()
}

pub async fn change_password(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(req): Json<PasswordChangeRequest>,
) -> AppResult<Response> {
    let updated = state
        .auth
        .credentials
        .update_credentials(&claims.sub, &req.current_password, req.new_username, req.new_password)
        .await?;
    session_response(&state, &updated.username, false, json!({}))
}

pub async fn totp_setup(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(req): Json<TotpSetupRequest>,
) -> AppResult<Json<TotpSetupResponse>> {
    require_current_password(&state, &claims.sub, &req.current_password).await?;
    let (secret, qr_code_data_uri) = state
        .auth
        .totp_sessions
        .create_setup_session(&claims.sub)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;
    Ok(Json(TotpSetupResponse {
        success: true,
        secret,
        qr_code_data_uri,
    }))
}

pub async fn totp_confirm(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(req): Json<TotpCodeRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let secret = state.auth.totp_sessions.get(&claims.sub).await.ok_or(AppError::Auth(AuthError::NoSetupSession))?;
    if !totp::verify_code(&claims.sub, &secret, &req.totp_code) {
        return Err(AppError::Auth(AuthError::InvalidTotp));
    }
    let backup_codes = totp::generate_backup_codes();
    let secret_encrypted = crypto::encrypt(&secret)?;
    let backup_codes_encrypted = crypto::encrypt(&serde_json::to_string(&backup_codes).map_err(|e| AppError::Store(e.to_string()))?)?;
    state.auth.credentials.set_totp(&claims.sub, secret_encrypted, backup_codes_encrypted).await?;
    state.auth.totp_sessions.confirm(&claims.sub).await;
    Ok(Json(json!({"success": true, "backup_codes": backup_codes})))
}

pub async fn totp_disable(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(req): Json<TotpDisableRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let user = require_current_password(&state, &claims.sub, &req.current_password).await?;
    let secret_encrypted = user.totp_secret_encrypted.as_deref().ok_or(AppError::Auth(AuthError::InvalidTotp))?;
    let secret = crypto::decrypt(secret_encrypted)?;
    if !totp::verify_code(&claims.sub, &secret, &req.totp_code) {
        return Err(AppError::Auth(AuthError::InvalidTotp));
    }
    state.auth.credentials.clear_totp(&claims.sub).await?;
    Ok(Json(json!({"success": true})))
}

pub async fn regenerate_backup_codes(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(req): Json<TotpDisableRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let user = require_current_password(&state, &claims.sub, &req.current_password).await?;
    let secret_encrypted = user.totp_secret_encrypted.as_deref().ok_or(AppError::Auth(AuthError::InvalidTotp))?;
    let secret = crypto::decrypt(secret_encrypted)?;
    if !totp::verify_code(&claims.sub, &secret, &req.totp_code) {
        return Err(AppError::Auth(AuthError::InvalidTotp));
    }
    let backup_codes = totp::generate_backup_codes();
    let backup_codes_encrypted = crypto::encrypt(&serde_json::to_string(&backup_codes).map_err(|e| AppError::Store(e.to_string()))?)?;
    state.auth.credentials.set_backup_codes(&claims.sub, backup_codes_encrypted).await?;
    Ok(Json(json!({"success": true, "backup_codes": backup_codes})))
}
