// ABOUTME: Environment-only server configuration: ports, database, system keys, billing knobs
// ABOUTME: All tunable constants (markup, batch sizes, pre-flight floor) live here, not in code
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Server Configuration
//!
//! Environment-only configuration. Every deployment knob is an environment
//! variable with a documented default; nothing is read from files.
//!
//! ## Variables
//!
//! | Variable | Default | Purpose |
//! |----------|---------|---------|
//! | `HTTP_PORT` | `8081` | WebSocket/HTTP listen port |
//! | `DATABASE_URL` | `sqlite:durachat.db` | sqlx connection string |
//! | `ENCRYPTION_MASTER_KEY` | (generated, dev only) | base64 32-byte master secret for API key encryption |
//! | `GOOGLE_API_KEY` / `OPENAI_API_KEY` | unset | system keys billed against user credits |
//! | `CREDIT_MARKUP_PERCENT` | `5` | markup applied to system-key usage |
//! | `PREFLIGHT_FLOOR_CENTS` | `5` | advisory minimum balance before starting a system-key stream |
//! | `PERSIST_BATCH_SIZE` | `5` | tokens buffered before a persistence write |
//! | `THINKING_WS_BATCH_SIZE` | `10` | thinking tokens buffered per WebSocket send |

use crate::errors::{AppError, AppResult};
use base64::{engine::general_purpose, Engine};
use rand::RngCore;
use std::collections::HashMap;
use std::env;
use tracing::warn;

/// Default WebSocket listen port
const DEFAULT_HTTP_PORT: u16 = 8081;

/// Default markup percentage for system-key usage
const DEFAULT_MARKUP_PERCENT: u32 = 5;

/// Default advisory pre-flight balance floor, in cents
const DEFAULT_PREFLIGHT_FLOOR_CENTS: i64 = 5;

/// Default token batch size for persistence writes
const DEFAULT_PERSIST_BATCH_SIZE: usize = 5;

/// Default thinking-token batch size for WebSocket delivery
const DEFAULT_THINKING_WS_BATCH_SIZE: usize = 10;

/// Per-provider system API keys, billed to user credits with markup
#[derive(Debug, Clone, Default)]
pub struct SystemKeys {
    keys: HashMap<String, String>,
}

impl SystemKeys {
    /// Load system keys from the conventional environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut keys = HashMap::new();
        for (provider, var) in [("google", "GOOGLE_API_KEY"), ("openai", "OPENAI_API_KEY")] {
            if let Ok(value) = env::var(var) {
                if !value.trim().is_empty() {
                    keys.insert(provider.to_owned(), value);
                }
            }
        }
        Self { keys }
    }

    /// Build from an explicit map (used by tests)
    #[must_use]
    pub fn from_map(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    /// Get the system key for a provider
    ///
    /// # Errors
    ///
    /// Returns `ProviderNotConfigured` when no key is set for the provider.
    pub fn get(&self, provider: &str) -> AppResult<&str> {
        self.keys
            .get(provider)
            .map(String::as_str)
            .ok_or_else(|| AppError::provider_not_configured(provider))
    }

    /// Check whether a system key exists for a provider
    #[must_use]
    pub fn contains(&self, provider: &str) -> bool {
        self.keys.contains_key(provider)
    }
}

/// Credit and markup configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Markup percentage applied to base cost when using a system key
    pub markup_percent: u32,
    /// Advisory minimum balance (cents) required before starting a system-key stream
    pub preflight_floor_cents: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            markup_percent: DEFAULT_MARKUP_PERCENT,
            preflight_floor_cents: DEFAULT_PREFLIGHT_FLOOR_CENTS,
        }
    }
}

/// Token batching configuration for the streaming pipeline
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Tokens buffered before each incremental persistence write
    pub persist_batch_size: usize,
    /// Thinking tokens buffered per WebSocket send, for providers that batch
    pub thinking_ws_batch_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            persist_batch_size: DEFAULT_PERSIST_BATCH_SIZE,
            thinking_ws_batch_size: DEFAULT_THINKING_WS_BATCH_SIZE,
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket/HTTP listen port
    pub http_port: u16,
    /// sqlx connection string
    pub database_url: String,
    /// 32-byte master secret for per-user API key encryption
    pub encryption_master_key: [u8; 32],
    /// Per-provider system API keys
    pub system_keys: SystemKeys,
    /// Credit markup and pre-flight settings
    pub billing: BillingConfig,
    /// Token batching settings
    pub streaming: StreamingConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed (bad base64
    /// master key, non-numeric port, etc.). Missing optional variables fall
    /// back to documented defaults.
    pub fn from_env() -> AppResult<Self> {
        let http_port = parse_env("HTTP_PORT", DEFAULT_HTTP_PORT)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:durachat.db".into());

        let encryption_master_key = load_master_key()?;

        let billing = BillingConfig {
            markup_percent: parse_env("CREDIT_MARKUP_PERCENT", DEFAULT_MARKUP_PERCENT)?,
            preflight_floor_cents: parse_env(
                "PREFLIGHT_FLOOR_CENTS",
                DEFAULT_PREFLIGHT_FLOOR_CENTS,
            )?,
        };

        let streaming = StreamingConfig {
            persist_batch_size: parse_env("PERSIST_BATCH_SIZE", DEFAULT_PERSIST_BATCH_SIZE)?,
            thinking_ws_batch_size: parse_env(
                "THINKING_WS_BATCH_SIZE",
                DEFAULT_THINKING_WS_BATCH_SIZE,
            )?,
        };

        Ok(Self {
            http_port,
            database_url,
            encryption_master_key,
            system_keys: SystemKeys::from_env(),
            billing,
            streaming,
        })
    }
}

/// Parse an environment variable, falling back to a default when unset
fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> AppResult<T> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| AppError::config(format!("Invalid value for {var}: {value}"))),
        Err(_) => Ok(default),
    }
}

/// Load the master encryption key, or generate a development key with a warning
fn load_master_key() -> AppResult<[u8; 32]> {
    if let Ok(encoded) = env::var("ENCRYPTION_MASTER_KEY") {
        let bytes = general_purpose::STANDARD
            .decode(&encoded)
            .map_err(|e| AppError::config(format!("Invalid base64 in ENCRYPTION_MASTER_KEY: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            AppError::config("ENCRYPTION_MASTER_KEY must decode to exactly 32 bytes")
        })?;
        return Ok(key);
    }

    warn!("ENCRYPTION_MASTER_KEY not set, generating a temporary key - NOT SECURE FOR PRODUCTION");
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    warn!(
        "Generated master key (save for production): ENCRYPTION_MASTER_KEY={}",
        general_purpose::STANDARD.encode(key)
    );
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_keys_lookup() {
        let mut map = HashMap::new();
        map.insert("google".to_owned(), "g-key".to_owned());
        let keys = SystemKeys::from_map(map);

        assert_eq!(keys.get("google").unwrap(), "g-key");
        assert!(keys.get("openai").is_err());
        assert!(keys.contains("google"));
        assert!(!keys.contains("anthropic"));
    }

    #[test]
    fn test_billing_defaults() {
        let billing = BillingConfig::default();
        assert_eq!(billing.markup_percent, 5);
        assert_eq!(billing.preflight_floor_cents, 5);
    }

    #[test]
    fn test_streaming_defaults() {
        let streaming = StreamingConfig::default();
        assert_eq!(streaming.persist_batch_size, 5);
        assert_eq!(streaming.thinking_ws_batch_size, 10);
    }
}
