// ABOUTME: AES-256-GCM encryption for per-user API key material
// ABOUTME: Derives a user-scoped key via PBKDF2 from the master secret and the user id
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # API Key Encryption
//!
//! User-supplied provider API keys are stored encrypted in the settings row.
//! Each user's encryption key is derived on demand from the server-side
//! master secret with the user id as salt; plaintext keys are never persisted.
//!
//! The stored format keeps ciphertext, IV, and authentication tag as separate
//! base64 fields so the tag is always verified on decrypt.

use std::collections::HashMap;
use std::num::NonZeroU32;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use base64::{engine::general_purpose, Engine};
use rand::RngCore;
use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// 96-bit IV for GCM
const IV_LENGTH: usize = 12;

/// 128-bit authentication tag
const TAG_LENGTH: usize = 16;

/// PBKDF2 iteration count for the per-user key derivation
const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// One encrypted API key: ciphertext, IV, and auth tag as separate base64 fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedData {
    /// Base64 ciphertext (tag stripped)
    pub encrypted_data: String,
    /// Base64 96-bit IV
    pub iv: String,
    /// Base64 128-bit authentication tag
    pub tag: String,
}

/// Map of provider name to its encrypted API key, as stored in user settings
pub type EncryptedKeyMap = HashMap<String, EncryptedData>;

/// Cipher for user-scoped API key encryption
///
/// Holds only the master secret; the per-user AES key is derived per call.
pub struct ApiKeyCipher {
    master_key: [u8; 32],
}

impl ApiKeyCipher {
    /// Create a cipher from the server's master secret
    #[must_use]
    pub const fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    /// Derive the AES-256 key for a user: PBKDF2-SHA256(master, salt = user id)
    fn derive_key(&self, user_id: Uuid) -> [u8; 32] {
        let salt = format!("durachat_{user_id}_salt");
        let mut key = [0u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            salt.as_bytes(),
            &self.master_key,
            &mut key,
        );
        key
    }

    /// Encrypt a single API key for a user
    ///
    /// # Errors
    ///
    /// Returns `EncryptionFailure` if AEAD encryption fails.
    pub fn encrypt(&self, plaintext: &str, user_id: Uuid) -> AppResult<EncryptedData> {
        let key = self.derive_key(user_id);
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));

        let mut iv = [0u8; IV_LENGTH];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = GenericArray::from_slice(&iv);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AppError::encryption(format!("Encryption failed: {e}")))?;

        // aes-gcm appends the tag; the stored format keeps it separate
        let split = sealed.len() - TAG_LENGTH;
        Ok(EncryptedData {
            encrypted_data: general_purpose::STANDARD.encode(&sealed[..split]),
            iv: general_purpose::STANDARD.encode(iv),
            tag: general_purpose::STANDARD.encode(&sealed[split..]),
        })
    }

    /// Decrypt a single API key for a user, verifying the authentication tag
    ///
    /// # Errors
    ///
    /// Returns `EncryptionFailure` on malformed base64, wrong IV length, or
    /// tag verification failure (wrong user, tampered ciphertext).
    pub fn decrypt(&self, data: &EncryptedData, user_id: Uuid) -> AppResult<String> {
        let iv = general_purpose::STANDARD
            .decode(&data.iv)
            .map_err(|e| AppError::encryption(format!("Invalid IV encoding: {e}")))?;
        if iv.len() != IV_LENGTH {
            return Err(AppError::encryption("IV must be 12 bytes"));
        }

        let ciphertext = general_purpose::STANDARD
            .decode(&data.encrypted_data)
            .map_err(|e| AppError::encryption(format!("Invalid ciphertext encoding: {e}")))?;
        let tag = general_purpose::STANDARD
            .decode(&data.tag)
            .map_err(|e| AppError::encryption(format!("Invalid tag encoding: {e}")))?;
        if tag.len() != TAG_LENGTH {
            return Err(AppError::encryption("Authentication tag must be 16 bytes"));
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let key = self.derive_key(user_id);
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
        let plaintext = cipher
            .decrypt(GenericArray::from_slice(&iv), sealed.as_slice())
            .map_err(|_| AppError::encryption("Decryption failed: tag verification error"))?;

        String::from_utf8(plaintext)
            .map_err(|e| AppError::encryption(format!("Decrypted key is not UTF-8: {e}")))
    }

    /// Encrypt a provider -> API key map, skipping empty keys
    ///
    /// # Errors
    ///
    /// Returns an error if any individual encryption fails.
    pub fn encrypt_keys(
        &self,
        api_keys: &HashMap<String, String>,
        user_id: Uuid,
    ) -> AppResult<EncryptedKeyMap> {
        let mut encrypted = EncryptedKeyMap::new();
        for (provider, api_key) in api_keys {
            if api_key.trim().is_empty() {
                continue;
            }
            encrypted.insert(provider.clone(), self.encrypt(api_key, user_id)?);
        }
        Ok(encrypted)
    }

    /// Decrypt a provider -> encrypted key map
    ///
    /// A key that fails to decrypt is skipped with a warning; remaining keys
    /// are still returned. A corrupted entry for one provider must not block
    /// access to the others.
    #[must_use]
    pub fn decrypt_keys(
        &self,
        encrypted_keys: &EncryptedKeyMap,
        user_id: Uuid,
    ) -> HashMap<String, String> {
        let mut decrypted = HashMap::new();
        for (provider, data) in encrypted_keys {
            match self.decrypt(data, user_id) {
                Ok(key) => {
                    decrypted.insert(provider.clone(), key);
                }
                Err(e) => {
                    warn!(
                        provider = %provider,
                        user_id = %user_id,
                        error = %e,
                        "Failed to decrypt stored API key, skipping"
                    );
                }
            }
        }
        decrypted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ApiKeyCipher {
        ApiKeyCipher::new([7u8; 32])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let user_id = Uuid::new_v4();
        let encrypted = cipher().encrypt("sk-test-12345", user_id).unwrap();
        let decrypted = cipher().decrypt(&encrypted, user_id).unwrap();
        assert_eq!(decrypted, "sk-test-12345");
    }

    #[test]
    fn test_decrypt_with_wrong_user_fails() {
        let encrypted = cipher().encrypt("sk-test-12345", Uuid::new_v4()).unwrap();
        let result = cipher().decrypt(&encrypted, Uuid::new_v4());
        assert!(result.is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails_tag_verification() {
        let user_id = Uuid::new_v4();
        let mut encrypted = cipher().encrypt("sk-test-12345", user_id).unwrap();
        let mut bytes = general_purpose::STANDARD
            .decode(&encrypted.encrypted_data)
            .unwrap();
        bytes[0] ^= 0xff;
        encrypted.encrypted_data = general_purpose::STANDARD.encode(bytes);

        assert!(cipher().decrypt(&encrypted, user_id).is_err());
    }

    #[test]
    fn test_key_map_skips_corrupted_entries() {
        let user_id = Uuid::new_v4();
        let mut keys = HashMap::new();
        keys.insert("google".to_owned(), "g-key".to_owned());
        keys.insert("openai".to_owned(), "o-key".to_owned());

        let mut encrypted = cipher().encrypt_keys(&keys, user_id).unwrap();
        encrypted.get_mut("openai").unwrap().tag =
            general_purpose::STANDARD.encode([0u8; TAG_LENGTH]);

        let decrypted = cipher().decrypt_keys(&encrypted, user_id);
        assert_eq!(decrypted.get("google").map(String::as_str), Some("g-key"));
        assert!(!decrypted.contains_key("openai"));
    }

    #[test]
    fn test_empty_keys_skipped_on_encrypt() {
        let user_id = Uuid::new_v4();
        let mut keys = HashMap::new();
        keys.insert("google".to_owned(), "  ".to_owned());
        let encrypted = cipher().encrypt_keys(&keys, user_id).unwrap();
        assert!(encrypted.is_empty());
    }
}
