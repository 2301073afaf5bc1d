//! Credentials store (spec §3 `Credentials`, §4.8).
//!
//! Single JSON-backed relational table, write-temp + rename like the
//! other stores. Password hashing uses argon2 rather than the original
//! system's bcrypt — argon2 plus the `password-hash` crate family is
//! the modern default for new Rust code.

use std::path::{Path, PathBuf};

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::{AppError, AppResult};

pub const DEFAULT_USERNAME: &str = "admin_shield";
pub const DEFAULT_PASSWORD: &str = "nginxshield";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub updated_at: DateTime<Utc>,
    pub requires_password_change: bool,
    pub totp_enabled: bool,
    pub totp_secret_encrypted: Option<String>,
    pub totp_activated_at: Option<DateTime<Utc>>,
    pub backup_codes_encrypted: Option<String>,
}

#[derive(Default, Serialize, Deserialize)]
struct CredentialsFile {
    rows: Vec<Credentials>,
}

pub struct CredentialsStore {
    path: PathBuf,
    file: RwLock<CredentialsFile>,
}

pub struct VerifyOutcome {
    pub authenticated: bool,
    pub requires_totp: bool,
    pub requires_password_change: bool,
    pub is_first_login: bool,
    pub username: Option<String>,
}

impl CredentialsStore {
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let file = Self::read_or_create(&path).await?;
        Ok(Self {
            path,
            file: RwLock::new(file),
        })
    }

    async fn read_or_create(path: &Path) -> anyhow::Result<CredentialsFile> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, serde_json::to_vec_pretty(&CredentialsFile::default())?).await?;
        }
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    async fn persist(&self, file: &CredentialsFile) -> AppResult<()> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(file).map_err(|e| AppError::Store(e.to_string()))?;
        tokio::fs::write(&tmp, bytes).await.map_err(|e| AppError::Store(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| AppError::Store(e.to_string()))?;
        Ok(())
    }

    pub fn hash_password(password: &str) -> AppResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| AppError::Store(format!("password hashing failed: {e}")))
    }

    pub fn verify_password(password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
    }

    pub fn validate_username(username: &str) -> AppResult<()> {
        let trimmed = username.trim();
        if trimmed.is_empty() {
            return Err(AppError::validation("username cannot be empty"));
        }
        if trimmed.len() < 3 {
            return Err(AppError::validation("username must be at least 3 characters"));
        }
        if trimmed.len() > 50 {
            return Err(AppError::validation("username cannot exceed 50 characters"));
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(AppError::validation("username may only contain letters, digits, underscore and hyphen"));
        }
        Ok(())
    }

    /// Same five rules as the original `is_strong_password` /
    /// `validate_password_requirements`.
    pub fn validate_password(password: &str) -> AppResult<()> {
        let mut missing = Vec::new();
        if password.len() < 8 {
            missing.push("at least 8 characters");
        }
        if !password.chars().any(|c| c.is_ascii_uppercase()) {
            missing.push("an uppercase letter");
        }
        if !password.chars().any(|c| c.is_ascii_lowercase()) {
            missing.push("a lowercase letter");
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            missing.push("a digit");
        }
        if !password.chars().any(|c| !c.is_ascii_alphanumeric()) {
            missing.push("a special character");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::validation(format!("password missing: {}", missing.join(", "))))
        }
    }

    pub async fn is_first_login(&self) -> bool {
        self.file.read().await.rows.is_empty()
    }

    pub async fn find_by_username(&self, username: &str) -> Option<Credentials> {
        self.file.read().await.rows.iter().find(|r| r.username == username).cloned()
    }

    /// spec §4.8 "verify_credentials": default-credential bootstrap path
    /// on an empty store, else password (and TOTP gate) verification.
    pub async fn verify_credentials(&self, username: &str, password: &str) -> VerifyOutcome {
        let is_first_login = self.is_first_login().await;
        let Some(user) = self.find_by_username(username).await else {
            let authenticated = username == DEFAULT_USERNAME && password == DEFAULT_PASSWORD && is_first_login;
            return VerifyOutcome {
                authenticated,
                requires_totp: false,
                requires_password_change: authenticated,
                is_first_login,
                username: authenticated.then(|| username.to_string()),
            };
        };

        if !Self::verify_password(password, &user.password_hash) {
            return VerifyOutcome {
                authenticated: false,
                requires_totp: false,
                requires_password_change: false,
                is_first_login: false,
                username: None,
            };
        }

        if user.totp_enabled {
            return VerifyOutcome {
                authenticated: false,
                requires_totp: true,
                requires_password_change: user.requires_password_change,
                is_first_login: false,
                username: Some(user.username),
            };
        }

        VerifyOutcome {
            authenticated: true,
            requires_totp: false,
            requires_password_change: user.requires_password_change,
            is_first_login: false,
            username: Some(user.username),
        }
    }

    /// Creates the first row on bootstrap, or updates an existing user's
    /// username/password in place (spec §4.8 "update_credentials").
    pub async fn update_credentials(
        &self,
        old_username: &str,
        current_password: &str,
        new_username: Option<String>,
        new_password: Option<String>,
    ) -> AppResult<Credentials> {
        let mut file = self.file.write().await;
        let existing_index = file.rows.iter().position(|r| r.username == old_username);

        let Some(index) = existing_index else {
            if old_username != DEFAULT_USERNAME || current_password != DEFAULT_PASSWORD || !file.rows.is_empty() {
                return Err(AppError::validation("user not found or default credentials invalid"));
            }
            let new_username = new_username.ok_or_else(|| AppError::validation("new username is required"))?;
            let new_password = new_password.ok_or_else(|| AppError::validation("new password is required"))?;
            Self::validate_username(&new_username)?;
            Self::validate_password(&new_password)?;
            if file.rows.iter().any(|r| r.username == new_username) {
                return Err(AppError::Conflict("username already in use".into()));
            }
            let row = Credentials {
                id: uuid::Uuid::new_v4().to_string(),
                username: new_username,
                password_hash: Self::hash_password(&new_password)?,
                updated_at: Utc::now(),
                requires_password_change: false,
                totp_enabled: false,
                totp_secret_encrypted: None,
                totp_activated_at: None,
                backup_codes_encrypted: None,
            };
            file.rows.push(row.clone());
            self.persist(&file).await?;
            return Ok(row);
        };

        if !Self::verify_password(current_password, &file.rows[index].password_hash) {
            return Err(AppError::Auth(crate::errors::AuthError::InvalidCredentials));
        }

        if let Some(ref new_password) = new_password {
            Self::validate_password(new_password)?;
            if Self::verify_password(new_password, &file.rows[index].password_hash) {
                return Err(AppError::validation("new password must differ from the current password"));
            }
            file.rows[index].password_hash = Self::hash_password(new_password)?;
            file.rows[index].requires_password_change = false;
        }

        if let Some(ref new_username) = new_username {
            if new_username != old_username {
                Self::validate_username(new_username)?;
                if file.rows.iter().any(|r| r.username == *new_username) {
                    return Err(AppError::Conflict("username already in use".into()));
                }
                file.rows[index].username = new_username.clone();
            }
        }

        file.rows[index].updated_at = Utc::now();
        let updated = file.rows[index].clone();
        self.persist(&file).await?;
        Ok(updated)
    }

    pub async fn replace_password(&self, username: &str, new_password_hash: String) -> AppResult<()> {
        let mut file = self.file.write().await;
        let row = file
            .rows
            .iter_mut()
            .find(|r| r.username == username)
            .ok_or_else(|| AppError::NotFound(format!("user {username}")))?;
        row.password_hash = new_password_hash;
        row.requires_password_change = true;
        row.totp_enabled = false;
        row.totp_secret_encrypted = None;
        row.totp_activated_at = None;
        row.backup_codes_encrypted = None;
        row.updated_at = Utc::now();
        self.persist(&file).await
    }

    pub async fn set_totp(
        &self,
        username: &str,
        secret_encrypted: String,
        backup_codes_encrypted: String,
    ) -> AppResult<()> {
        let mut file = self.file.write().await;
        let row = file
            .rows
            .iter_mut()
            .find(|r| r.username == username)
            .ok_or_else(|| AppError::NotFound(format!("user {username}")))?;
        row.totp_enabled = true;
        row.totp_secret_encrypted = Some(secret_encrypted);
        row.totp_activated_at = Some(Utc::now());
        row.backup_codes_encrypted = Some(backup_codes_encrypted);
        self.persist(&file).await
    }

    pub async fn clear_totp(&self, username: &str) -> AppResult<()> {
        let mut file = self.file.write().await;
        let row = file
            .rows
            .iter_mut()
            .find(|r| r.username == username)
            .ok_or_else(|| AppError::NotFound(format!("user {username}")))?;
        row.totp_enabled = false;
        row.totp_secret_encrypted = None;
        row.totp_activated_at = None;
        row.backup_codes_encrypted = None;
        self.persist(&file).await
    }

    pub async fn set_backup_codes(&self, username: &str, backup_codes_encrypted: String) -> AppResult<()> {
        let mut file = self.file.write().await;
        let row = file
            .rows
            .iter_mut()
            .find(|r| r.username == username)
            .ok_or_else(|| AppError::NotFound(format!("user {username}")))?;
        row.backup_codes_encrypted = Some(backup_codes_encrypted);
        self.persist(&file).await
    }
}

/// spec §4.8 "backup-code recovery": 12-char alnum password.
pub fn generate_recovery_password() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..12).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_credentials_authenticate_on_first_login_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::load(dir.path().join("auth.json")).await.unwrap();
        let outcome = store.verify_credentials(DEFAULT_USERNAME, DEFAULT_PASSWORD).await;
        assert!(outcome.authenticated);
        assert!(outcome.requires_password_change);
    }

    #[tokio::test]
    async fn update_credentials_bootstraps_then_requires_new_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::load(dir.path().join("auth.json")).await.unwrap();
        store
            .update_credentials(DEFAULT_USERNAME, DEFAULT_PASSWORD, Some("admin".into()), Some("Str0ng!Pass".into()))
            .await
            .unwrap();
        let outcome = store.verify_credentials(DEFAULT_USERNAME, DEFAULT_PASSWORD).await;
        assert!(!outcome.authenticated);
        let outcome = store.verify_credentials("admin", "Str0ng!Pass").await;
        assert!(outcome.authenticated);
        assert!(!outcome.requires_password_change);
    }

    #[test]
    fn password_strength_rules_match_original() {
        assert!(CredentialsStore::validate_password("weak").is_err());
        assert!(CredentialsStore::validate_password("Str0ng!Pass").is_ok());
    }
}
