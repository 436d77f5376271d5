// ABOUTME: Unified error handling system with stable error codes for the chat core
// ABOUTME: Maps domain errors (provider, credits, session, crypto) to wire/HTTP semantics
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Unified Error Handling System
//!
//! Centralized error types for the durachat server. Every fallible operation
//! returns [`AppError`], which carries a stable [`ErrorCode`], a human-readable
//! message, and optional context for tracing.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Standard error codes used throughout the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Authentication & Authorization (1000-1999)
    #[serde(rename = "INVALID_SESSION")]
    InvalidSession = 1000,
    #[serde(rename = "PERMISSION_DENIED")]
    PermissionDenied = 1001,

    // Credits & Billing (2000-2999)
    #[serde(rename = "INSUFFICIENT_CREDITS")]
    InsufficientCredits = 2000,

    // Provider & Model Selection (3000-3999)
    #[serde(rename = "UNSUPPORTED_PROVIDER")]
    UnsupportedProvider = 3000,
    #[serde(rename = "UNSUPPORTED_MODEL")]
    UnsupportedModel = 3001,
    #[serde(rename = "PROVIDER_NOT_CONFIGURED")]
    ProviderNotConfigured = 3002,

    // Validation (4000-4999)
    #[serde(rename = "INVALID_INPUT")]
    InvalidInput = 4000,
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    ResourceNotFound = 4001,
    #[serde(rename = "RESOURCE_LOCKED")]
    ResourceLocked = 4002,

    // Upstream Providers (5000-5999)
    #[serde(rename = "PROVIDER_STREAM_ERROR")]
    ProviderStreamError = 5000,
    #[serde(rename = "EXTERNAL_RATE_LIMITED")]
    ExternalRateLimited = 5001,

    // Configuration (6000-6999)
    #[serde(rename = "CONFIG_ERROR")]
    ConfigError = 6000,

    // Crypto (7000-7999)
    #[serde(rename = "ENCRYPTION_FAILURE")]
    EncryptionFailure = 7000,

    // Internal Errors (9000-9999)
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError = 9000,
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError = 9001,
    #[serde(rename = "STORAGE_ERROR")]
    StorageError = 9002,
    #[serde(rename = "SERIALIZATION_ERROR")]
    SerializationError = 9003,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput | Self::UnsupportedProvider | Self::UnsupportedModel => 400,
            Self::InvalidSession => 401,
            Self::InsufficientCredits => 402,
            Self::PermissionDenied => 403,
            Self::ResourceNotFound => 404,
            Self::ResourceLocked => 409,
            Self::ProviderStreamError => 502,
            Self::ExternalRateLimited => 503,
            Self::ProviderNotConfigured
            | Self::ConfigError
            | Self::EncryptionFailure
            | Self::InternalError
            | Self::DatabaseError
            | Self::StorageError
            | Self::SerializationError => 500,
        }
    }

    /// Get a user-friendly description of this error
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::InvalidSession => "The session token is missing, invalid, or expired",
            Self::PermissionDenied => "You do not have permission to perform this action",
            Self::InsufficientCredits => "Insufficient credits for this operation",
            Self::UnsupportedProvider => "The requested AI provider is not supported",
            Self::UnsupportedModel => "The requested model is not supported by this provider",
            Self::ProviderNotConfigured => "No API key is configured for this provider",
            Self::InvalidInput => "The provided input is invalid",
            Self::ResourceNotFound => "The requested resource was not found",
            Self::ResourceLocked => "The resource is currently locked and cannot be modified",
            Self::ProviderStreamError => "The upstream AI provider failed while streaming",
            Self::ExternalRateLimited => "Upstream provider rate limit exceeded",
            Self::ConfigError => "Configuration error encountered",
            Self::EncryptionFailure => "Encryption or decryption of key material failed",
            Self::InternalError => "An internal server error occurred",
            Self::DatabaseError => "Database operation failed",
            Self::StorageError => "Storage operation failed",
            Self::SerializationError => "Data serialization/deserialization failed",
        }
    }
}

/// Additional context that can be attached to errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// User ID if available
    pub user_id: Option<Uuid>,
    /// Conversation ID if applicable
    pub conversation_id: Option<String>,
    /// Additional key-value context
    pub details: serde_json::Value,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            user_id: None,
            conversation_id: None,
            details: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Unified error type for the application
#[derive(Debug, Error)]
pub struct AppError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional context
    pub context: ErrorContext,
    /// Source error for error chaining
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new `AppError` with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Add a user ID to the error context
    #[must_use]
    pub fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.context.user_id = Some(user_id);
        self
    }

    /// Add a conversation ID to the error context
    #[must_use]
    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.context.conversation_id = Some(conversation_id.into());
        self
    }

    /// Add details to the error context
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.context.details = details;
        self
    }

    /// Add a source error for error chaining
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// Convenience constructors for the domain error taxonomy
impl AppError {
    /// Unknown provider name
    pub fn unsupported_provider(provider: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::UnsupportedProvider,
            format!("Unsupported provider: {}", provider.into()),
        )
    }

    /// Known provider, unknown model
    pub fn unsupported_model(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::UnsupportedModel,
            format!(
                "Unsupported model {} for provider {}",
                model.into(),
                provider.into()
            ),
        )
    }

    /// Session token failed validation
    pub fn invalid_session(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSession, message)
    }

    /// Balance too low for the requested usage
    pub fn insufficient_credits(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InsufficientCredits, message)
    }

    /// No resolvable API key for the provider
    pub fn provider_not_configured(provider: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ProviderNotConfigured,
            format!("API key not configured for provider: {}", provider.into()),
        )
    }

    /// Upstream provider failed mid-stream
    pub fn provider_stream(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ProviderStreamError,
            format!("{}: {}", provider.into(), message.into()),
        )
    }

    /// Key material could not be encrypted or decrypted
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EncryptionFailure, message)
    }

    /// Resource not found
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("{} not found", resource.into()),
        )
    }

    /// Invalid input
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        Self::new(ErrorCode::DatabaseError, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(ErrorCode::SerializationError, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        match error.source() {
            Some(source) => Self::new(ErrorCode::InternalError, error.to_string()).with_details(
                serde_json::json!({
                    "source": source.to_string()
                }),
            ),
            None => Self::new(ErrorCode::InternalError, error.to_string()),
        }
    }
}
