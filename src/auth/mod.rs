//! Auth & Session (spec §4.8).

pub mod credentials;
pub mod crypto;
pub mod session;
pub mod totp;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;

use crate::errors::{AppError, AuthError};
use credentials::CredentialsStore;
use session::{Claims, SessionManager};
use totp::TotpSessionManager;

pub struct AuthState {
    pub credentials: CredentialsStore,
    pub sessions: SessionManager,
    pub totp_sessions: TotpSessionManager,
    pub secure_cookies: std::sync::atomic::AtomicBool,
}

impl AuthState {
    pub async fn load(credentials_path: impl Into<std::path::PathBuf>, jwt_secret: &str) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            credentials: CredentialsStore::load(credentials_path).await?,
            sessions: SessionManager::new(jwt_secret),
            totp_sessions: TotpSessionManager::new(),
            secure_cookies: std::sync::atomic::AtomicBool::new(false),
        }))
    }
}

/// An authenticated request's session claims; axum extractor used by
/// every non-public handler (spec §6 "Session via `sid` cookie").
pub struct AuthenticatedUser(pub Claims);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    Arc<AuthState>: axum::extract::FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_state: Arc<AuthState> = axum::extract::FromRef::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(session::SESSION_COOKIE_NAME)
            .map(|c| c.value().to_string())
            .ok_or(AppError::Auth(AuthError::MissingToken))?;
        let claims = auth_state.sessions.verify(&token)?;
        Ok(AuthenticatedUser(claims))
    }
}
