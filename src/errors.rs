//! Crate-wide error kinds (spec §7).
//!
//! Every typed component returns `Result<T, AppError>` so the API layer
//! never has to guess a failure's shape; `AppError` is the single place
//! that maps a failure onto an HTTP status and a `{success, message,
//! error_type}` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("authentication failed")]
    Auth(#[from] AuthError),

    #[error("{0} is already banned")]
    AlreadyBanned(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is banned under a different kind")]
    KindMismatch(String),

    #[error("{0} is covered by an existing CIDR ban")]
    CoveredByCidr(String),

    #[error("firewall error: {0}")]
    Firewall(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("missing session token")]
    MissingToken,
    #[error("session token expired")]
    TokenExpired,
    #[error("invalid session token")]
    InvalidToken,
    #[error("invalid TOTP code")]
    InvalidTotp,
    #[error("invalid backup codes")]
    InvalidBackupCodes,
    #[error("no TOTP setup in progress")]
    NoSetupSession,
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Auth(_) => "auth_error",
            AppError::AlreadyBanned(_) => "already_banned",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::KindMismatch(_) => "kind_mismatch",
            AppError::CoveredByCidr(_) => "covered_by_cidr",
            AppError::Firewall(_) => "firewall_error",
            AppError::Store(_) => "store_error",
            AppError::Upstream(_) => "upstream_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(AuthError::MissingToken)
            | AppError::Auth(AuthError::TokenExpired)
            | AppError::Auth(AuthError::InvalidToken)
            | AppError::Auth(AuthError::InvalidCredentials)
            | AppError::Auth(AuthError::InvalidTotp)
            | AppError::Auth(AuthError::InvalidBackupCodes)
            | AppError::Auth(AuthError::NoSetupSession) => StatusCode::UNAUTHORIZED,
            AppError::AlreadyBanned(_) => StatusCode::CONFLICT,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::KindMismatch(_) => StatusCode::CONFLICT,
            AppError::CoveredByCidr(_) => StatusCode::CONFLICT,
            AppError::Firewall(_) => StatusCode::BAD_GATEWAY,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
    error_type: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::warn!(error_type = self.error_type(), %status, "request failed: {}", self);
        let body = ErrorBody {
            success: false,
            message: self.to_string(),
            error_type: self.error_type(),
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
