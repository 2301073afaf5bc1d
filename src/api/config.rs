//! Config, Mail-config, and Secure-config handlers (spec §4.7 "Config",
//! "Mail config", "Secure config").

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::auth::AuthenticatedUser;
use crate::config::ShieldConfig;
use crate::errors::{AppError, AppResult};
use crate::mail::MailConfig;

pub async fn get_config(State(state): State<AppState>) -> Json<ShieldConfig> {
    Json(state.config.get().await)
}

pub async fn replace_config(State(state): State<AppState>, _user: AuthenticatedUser, Json(config): Json<ShieldConfig>) -> AppResult<Json<serde_json::Value>> {
    state.config.replace(config).await.map_err(|e| AppError::Store(e.to_string()))?;
    Ok(Json(json!({"success": true})))
}

pub async fn get_mail_config(State(state): State<AppState>, _user: AuthenticatedUser) -> Json<MailConfig> {
    Json(state.mailer.get_config().await)
}

pub async fn replace_mail_config(State(state): State<AppState>, _user: AuthenticatedUser, Json(config): Json<MailConfig>) -> AppResult<Json<serde_json::Value>> {
    state.mailer.replace_config(config).await?;
    Ok(Json(json!({"success": true})))
}

pub async fn get_secure_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"secure_cookies": state.auth.secure_cookies.load(Ordering::Relaxed)}))
}

#[derive(Deserialize)]
pub struct SecureConfigRequest {
    secure_cookies: bool,
}

pub async fn set_secure_config(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Json(req): Json<SecureConfigRequest>,
) -> Json<serde_json::Value> {
    state.auth.secure_cookies.store(req.secure_cookies, Ordering::Relaxed);
    Json(json!({"success": true, "secure_cookies": req.secure_cookies}))
}
