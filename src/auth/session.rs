//! Session tokens (spec §4.8 "Session token"): HMAC-signed JWTs carrying
//! (subject, issued_at, expires_at), delivered via an HTTP-only cookie
//! with a rolling 30-minute lifetime.

use std::time::Duration;

use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult, AuthError};

pub const SESSION_COOKIE_NAME: &str = "sid";
const SESSION_LIFETIME_SECS: i64 = 30 * 60;
const REISSUE_THRESHOLD_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub requires_password_change: bool,
}

pub struct SessionManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SessionManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn mint(&self, username: &str, requires_password_change: bool) -> AppResult<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: username.to_string(),
            iat: now,
            exp: now + SESSION_LIFETIME_SECS,
            requires_password_change,
        };
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| AppError::Store(format!("failed to mint session token: {e}")))
    }

    pub fn verify(&self, token: &str) -> AppResult<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default()).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AppError::Auth(AuthError::TokenExpired),
                _ => AppError::Auth(AuthError::InvalidToken),
            }
        })?;
        Ok(data.claims)
    }

    /// Rolling session: if the token has less than 30 s remaining,
    /// returns a fresh token for the caller to re-set.
    pub fn reissue_if_expiring(&self, claims: &Claims) -> AppResult<Option<String>> {
        let remaining = claims.exp - Utc::now().timestamp();
        if remaining < REISSUE_THRESHOLD_SECS {
            Ok(Some(self.mint(&claims.sub, claims.requires_password_change)?))
        } else {
            Ok(None)
        }
    }

    pub fn cookie<'a>(&self, token: String, secure: bool) -> Cookie<'a> {
        Cookie::build((SESSION_COOKIE_NAME, token))
            .http_only(true)
            .secure(secure)
            .same_site(if secure { SameSite::Strict } else { SameSite::Lax })
            .max_age(time::Duration::seconds(SESSION_LIFETIME_SECS))
            .path("/")
            .build()
    }

    pub fn expired_cookie<'a>(&self, secure: bool) -> Cookie<'a> {
        Cookie::build((SESSION_COOKIE_NAME, ""))
            .http_only(true)
            .secure(secure)
            .max_age(time::Duration::seconds(0))
            .path("/")
            .build()
    }
}

pub fn remaining_lifetime(claims: &Claims) -> Duration {
    let secs = (claims.exp - Utc::now().timestamp()).max(0);
    Duration::from_secs(secs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_verify_round_trips_subject() {
        let manager = SessionManager::new("test-signing-secret");
        let token = manager.mint("admin_shield", false).unwrap();
        let claims = manager.verify(&token).unwrap();
        assert_eq!(claims.sub, "admin_shield");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let manager = SessionManager::new("test-signing-secret");
        let mut token = manager.mint("admin_shield", false).unwrap();
        token.push('x');
        assert!(manager.verify(&token).is_err());
    }

    #[test]
    fn fresh_token_is_not_reissued() {
        let manager = SessionManager::new("test-signing-secret");
        let token = manager.mint("admin_shield", false).unwrap();
        let claims = manager.verify(&token).unwrap();
        assert!(manager.reissue_if_expiring(&claims).unwrap().is_none());
    }
}
