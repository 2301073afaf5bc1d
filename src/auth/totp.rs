//! TOTP setup/confirm/disable and backup-code recovery (spec §4.8,
//! `TOTPSetupSession`).
//!
//! Grounded on the original `auth_manager.py` + `totp_session_manager.py`
//! flow: a secret is generated and staged in memory (never persisted
//! until confirmed), QR-encoded for the enrollment screen, and the
//! staged session expires after 15 minutes if never confirmed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Mutex;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::errors::{AppError, AppResult, AuthError};

const APP_NAME: &str = "NginxShield";
const SETUP_SESSION_TTL: Duration = Duration::from_secs(15 * 60);
const BACKUP_CODE_COUNT: usize = 10;

pub struct SetupSession {
    pub secret: String,
    pub qr_code_data_uri: String,
    created_at: Instant,
}

pub struct TotpSessionManager {
    sessions: Mutex<HashMap<String, SetupSession>>,
}

impl TotpSessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// spec §4.8: generate a fresh secret, stage it (not yet persisted),
    /// and render its QR-code enrollment image.
    pub async fn create_setup_session(&self, username: &str) -> anyhow::Result<(String, String)> {
        let secret = Secret::generate_secret().to_encoded().to_string();
        let totp = build_totp(username, &secret)?;
        let qr_code_data_uri = render_qr(&totp.get_url())?;

        self.sessions.lock().await.insert(
            username.to_string(),
            SetupSession {
                secret: secret.clone(),
                qr_code_data_uri: qr_code_data_uri.clone(),
                created_at: Instant::now(),
            },
        );
        Ok((secret, qr_code_data_uri))
    }

    pub async fn get(&self, username: &str) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(username)
            .filter(|s| s.created_at.elapsed() < SETUP_SESSION_TTL)
            .map(|s| s.secret.clone())
    }

    pub async fn confirm(&self, username: &str) {
        self.sessions.lock().await.remove(username);
    }

    /// Background sweeper (spec §4.8 "TOTP session manager", 60 s).
    pub async fn sweep_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|_, s| s.created_at.elapsed() < SETUP_SESSION_TTL);
        }
    }
}

impl Default for TotpSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn build_totp(username: &str, secret: &str) -> anyhow::Result<TOTP> {
    Ok(TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        Secret::Encoded(secret.to_string()).to_bytes().map_err(|e| anyhow::anyhow!("{e:?}"))?,
        Some(APP_NAME.to_string()),
        username.to_string(),
    )?)
}

fn render_qr(uri: &str) -> anyhow::Result<String> {
    let code = QrCode::new(uri.as_bytes())?;
    let svg_image = code.render::<svg::Color>().min_dimensions(200, 200).build();
    let encoded = base64::engine::general_purpose::STANDARD.encode(svg_image.as_bytes());
    Ok(format!("data:image/svg+xml;base64,{encoded}"))
}

/// `verify(username, secret, code)` with a ±1 step window, per the
/// original's `totp.verify(totp_code, valid_window=1)`.
pub fn verify_code(username: &str, secret: &str, code: &str) -> bool {
    let Ok(totp) = build_totp(username, secret) else {
        return false;
    };
    totp.check_current(code).unwrap_or(false) || {
        let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
        totp.check(code, now.saturating_sub(30)) || totp.check(code, now + 30)
    }
}

pub fn generate_backup_codes() -> Vec<String> {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..BACKUP_CODE_COUNT)
        .map(|_| (0..8).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect())
        .collect()
}

/// spec §4.8 "Backup-code recovery": all ten codes must match the
/// stored set, order-insensitive, uppercase-normalized.
pub fn verify_backup_codes(provided: &[String], stored: &[String]) -> AppResult<()> {
    if provided.len() != BACKUP_CODE_COUNT {
        return Err(AppError::validation(format!(
            "exactly {BACKUP_CODE_COUNT} codes are required, got {}",
            provided.len()
        )));
    }
    let normalized_stored: Vec<String> = stored.iter().map(|c| c.trim().to_uppercase()).collect();
    for code in provided {
        let normalized = code.trim().to_uppercase();
        if !normalized_stored.contains(&normalized) {
            return Err(AppError::Auth(AuthError::InvalidBackupCodes));
        }
    }
    Ok(())
}

pub fn shuffled_preview(codes: &[String]) -> Vec<String> {
    let mut out = codes.to_vec();
    out.shuffle(&mut rand::thread_rng());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_verifies_against_its_own_secret() {
        let secret = Secret::generate_secret().to_encoded().to_string();
        let totp = build_totp("alice", &secret).unwrap();
        let code = totp.generate_current().unwrap();
        assert!(verify_code("alice", &secret, &code));
        assert!(!verify_code("alice", &secret, "000000"));
    }

    #[test]
    fn backup_codes_require_exact_set_of_ten() {
        let stored: Vec<String> = (0..10).map(|i| format!("CODE{i:04}")).collect();
        let mut provided = stored.clone();
        provided.reverse();
        assert!(verify_backup_codes(&provided, &stored).is_ok());

        let mut short = stored.clone();
        short.pop();
        assert!(verify_backup_codes(&short, &stored).is_err());

        let mut wrong = stored.clone();
        wrong[0] = "NOTREAL0".to_string();
        assert!(verify_backup_codes(&wrong, &stored).is_err());
    }
}
