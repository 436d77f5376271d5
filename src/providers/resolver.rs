// ABOUTME: Decides which API key funds a chat turn, user-supplied or system
// ABOUTME: User keys bypass billing; system keys require a positive credit balance
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Key Resolution
//!
//! Resolution order for a turn:
//!
//! 1. A user with a stored key for the provider uses it directly; no
//!    credits are consumed and no balance check runs.
//! 2. A stored key that fails to decrypt is skipped with a warning and
//!    resolution falls through to the system key.
//! 3. System-key turns require a strictly positive balance; the check
//!    happens here, before any network traffic.
//! 4. Anonymous sessions always use the system key and are never billed.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SystemKeys;
use crate::crypto::ApiKeyCipher;
use crate::errors::{AppError, AppResult};
use crate::store::ChatStore;

/// Outcome of key resolution for one turn
#[derive(Debug, Clone)]
pub struct KeyResolution {
    /// Plaintext API key to send upstream
    pub api_key: String,
    /// True when the key came from the user's own stored keys
    pub is_user_key: bool,
    /// Balance snapshot at resolution time, present only for billed turns
    pub remaining_credits: Option<i64>,
}

/// Resolves the funding key for a provider and user
pub struct KeyResolver {
    cipher: ApiKeyCipher,
    store: Arc<dyn ChatStore>,
    system_keys: SystemKeys,
}

impl KeyResolver {
    #[must_use]
    pub fn new(cipher: ApiKeyCipher, store: Arc<dyn ChatStore>, system_keys: SystemKeys) -> Self {
        Self {
            cipher,
            store,
            system_keys,
        }
    }

    /// Resolve the key that funds a turn against `provider`
    ///
    /// # Errors
    ///
    /// Returns `ProviderNotConfigured` when the system key is needed but
    /// absent, and `InsufficientCredits` when a known user would be billed
    /// with a non-positive balance.
    pub async fn resolve(
        &self,
        provider: &str,
        user_id: Option<Uuid>,
    ) -> AppResult<KeyResolution> {
        let Some(user_id) = user_id else {
            // Anonymous sessions ride the system key and are not billed
            let api_key = self.system_keys.get(provider)?.to_owned();
            return Ok(KeyResolution {
                api_key,
                is_user_key: false,
                remaining_credits: None,
            });
        };

        let settings = self.store.ensure_settings(user_id).await?;

        if let Some(encrypted) = settings.encrypted_api_keys.get(provider) {
            match self.cipher.decrypt(encrypted, user_id) {
                Ok(api_key) => {
                    debug!(provider, %user_id, "using user-supplied API key");
                    return Ok(KeyResolution {
                        api_key,
                        is_user_key: true,
                        remaining_credits: None,
                    });
                }
                Err(e) => {
                    warn!(
                        provider,
                        %user_id,
                        error = %e,
                        "stored API key failed to decrypt, falling back to system key"
                    );
                }
            }
        }

        let api_key = self.system_keys.get(provider)?.to_owned();
        if settings.balance_cents <= 0 {
            return Err(AppError::insufficient_credits(format!(
                "balance is {} cents",
                settings.balance_cents
            ))
            .with_user_id(user_id));
        }

        Ok(KeyResolution {
            api_key,
            is_user_key: false,
            remaining_credits: Some(settings.balance_cents),
        })
    }
}
