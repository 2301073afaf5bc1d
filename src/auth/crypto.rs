//! At-rest encryption for TOTP secrets and backup codes (spec §9 Open
//! Question: key derivation).
//!
//! The Python original encrypts with a Fernet key; this crate derives an
//! AES-256-GCM key via `SHA-256(server_passphrase || fixed_salt)`, where
//! `server_passphrase` comes from `NGINX_SHIELD_SECRET`. This is an
//! intentional break from on-disk compatibility with the original —
//! existing `credentials.json` rows from a Python install cannot be
//! decrypted by this binary and must be re-enrolled.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, AeadCore, Nonce};
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::errors::AppError;

const FIXED_SALT: &[u8] = b"nginx-shield.totp-at-rest.v1";
const DEV_FALLBACK_SECRET: &str = "nginx-shield-dev-only-do-not-use-in-production";

fn derive_key() -> [u8; 32] {
    let passphrase = std::env::var("NGINX_SHIELD_SECRET").unwrap_or_else(|_| {
        tracing::warn!("NGINX_SHIELD_SECRET not set, using a well-known development key");
        DEV_FALLBACK_SECRET.to_string()
    });
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.update(FIXED_SALT);
    hasher.finalize().into()
}

pub fn encrypt(plaintext: &str) -> Result<String, AppError> {
    let key = derive_key();
    let cipher = Aes256Gcm::new_from_slice(&key).expect("key is exactly 32 bytes");
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| AppError::Store("failed to encrypt sensitive data".into()))?;

    let mut combined = nonce.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(combined))
}

pub fn decrypt(encoded: &str) -> Result<String, AppError> {
    let key = derive_key();
    let cipher = Aes256Gcm::new_from_slice(&key).expect("key is exactly 32 bytes");
    let combined = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| AppError::Store("corrupt encrypted payload (base64)".into()))?;
    if combined.len() < 12 {
        return Err(AppError::Store("corrupt encrypted payload (too short)".into()));
    }
    let (nonce_bytes, ciphertext) = combined.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| AppError::Store("failed to decrypt sensitive data".into()))?;
    String::from_utf8(plaintext).map_err(|_| AppError::Store("decrypted payload is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        std::env::set_var("NGINX_SHIELD_SECRET", "test-secret-value");
        let plaintext = "JBSWY3DPEHPK3PXP";
        let encoded = encrypt(plaintext).unwrap();
        assert_ne!(encoded, plaintext);
        assert_eq!(decrypt(&encoded).unwrap(), plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        std::env::set_var("NGINX_SHIELD_SECRET", "test-secret-value");
        let encoded = encrypt("some-secret").unwrap();
        let mut bytes = base64::engine::general_purpose::STANDARD.decode(&encoded).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let tampered = base64::engine::general_purpose::STANDARD.encode(bytes);
        assert!(decrypt(&tampered).is_err());
    }
}
