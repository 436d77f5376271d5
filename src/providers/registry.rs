// ABOUTME: Immutable provider registry: model catalog, capability flags, adapter factories
// ABOUTME: Constructed once at startup and passed by reference to the orchestrator
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Provider Registry
//!
//! Lookup table from provider name to its model catalog, capability flags,
//! and adapter factory. Built once at startup ([`ProviderRegistry::standard`])
//! and never mutated afterwards; the orchestrator receives it by reference.
//!
//! Two distinct error cases:
//!
//! - unknown provider name produces `UnsupportedProvider`
//! - known provider, unknown model produces `UnsupportedModel`
//!
//! Pricing in the catalog is expressed in **cents per 1K tokens**; the
//! pricing engine owns rounding and fallbacks for uncatalogued models.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{AppError, AppResult};

use super::google::GoogleProvider;
use super::openai::OpenAiProvider;
use super::{ChatProvider, ProviderConfig, ReasoningEffort};

/// Factory that builds an adapter instance from a resolved configuration
pub type ProviderFactory = Arc<dyn Fn(ProviderConfig) -> Box<dyn ChatProvider> + Send + Sync>;

/// Catalog entry for one model
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Provider-specific model identifier
    pub id: &'static str,
    /// Human-readable name shown to users
    pub display_name: &'static str,
    /// Context window in tokens, when published
    pub context_window: Option<u32>,
    /// Prompt pricing in cents per 1K tokens
    pub prompt_cost_per_1k: Option<f64>,
    /// Completion pricing in cents per 1K tokens
    pub completion_cost_per_1k: Option<f64>,
    /// Model exposes an intermediate reasoning trace
    pub supports_thinking: bool,
    /// Model supports provider-side search grounding
    pub supports_search: bool,
    /// Model accepts a reasoning-effort hint
    pub supports_reasoning_effort: bool,
    /// Allowed effort levels, empty unless `supports_reasoning_effort`
    pub reasoning_effort_levels: &'static [ReasoningEffort],
    /// Effort applied when the client sends none
    pub default_reasoning_effort: Option<ReasoningEffort>,
}

impl ModelInfo {
    /// Catalog entry with no thinking, search, or effort support
    const fn basic(
        id: &'static str,
        display_name: &'static str,
        context_window: u32,
        prompt_cost_per_1k: f64,
        completion_cost_per_1k: f64,
    ) -> Self {
        Self {
            id,
            display_name,
            context_window: Some(context_window),
            prompt_cost_per_1k: Some(prompt_cost_per_1k),
            completion_cost_per_1k: Some(completion_cost_per_1k),
            supports_thinking: false,
            supports_search: false,
            supports_reasoning_effort: false,
            reasoning_effort_levels: &[],
            default_reasoning_effort: None,
        }
    }

    const fn with_thinking(mut self) -> Self {
        self.supports_thinking = true;
        self
    }

    const fn with_search(mut self) -> Self {
        self.supports_search = true;
        self
    }

    const fn with_reasoning_effort(
        mut self,
        levels: &'static [ReasoningEffort],
        default: ReasoningEffort,
    ) -> Self {
        self.supports_reasoning_effort = true;
        self.reasoning_effort_levels = levels;
        self.default_reasoning_effort = Some(default);
        self
    }
}

/// Catalog entry for one provider
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    /// Stable provider identifier, e.g. `"google"`
    pub name: &'static str,
    /// Human-readable name shown to users
    pub display_name: &'static str,
    /// Model selected when the client does not choose one
    pub default_model: &'static str,
    /// Attachment MIME types this provider accepts inline
    pub supported_attachment_types: &'static [&'static str],
    /// Models this provider serves
    pub models: Vec<ModelInfo>,
}

impl ProviderInfo {
    /// Look up a model in this provider's catalog
    #[must_use]
    pub fn model(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == model_id)
    }
}

struct ProviderEntry {
    info: ProviderInfo,
    factory: ProviderFactory,
}

/// Immutable provider name to catalog-and-factory mapping
pub struct ProviderRegistry {
    providers: HashMap<&'static str, ProviderEntry>,
}

impl ProviderRegistry {
    /// Create an empty registry
    ///
    /// Production code uses [`Self::standard`]; this constructor exists so
    /// tests can register scripted providers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a provider with its catalog and adapter factory
    pub fn register(&mut self, info: ProviderInfo, factory: ProviderFactory) {
        self.providers
            .insert(info.name, ProviderEntry { info, factory });
    }

    /// The production registry: Google Gemini and OpenAI catalogs
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();

        registry.register(
            google_catalog(),
            Arc::new(|config| Box::new(GoogleProvider::new(config)) as Box<dyn ChatProvider>),
        );
        registry.register(
            openai_catalog(),
            Arc::new(|config| Box::new(OpenAiProvider::new(config)) as Box<dyn ChatProvider>),
        );

        registry
    }

    /// Construct an adapter for `provider` with the resolved configuration
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedProvider` for unknown provider names.
    pub fn create(
        &self,
        provider: &str,
        config: ProviderConfig,
    ) -> AppResult<Box<dyn ChatProvider>> {
        let entry = self
            .providers
            .get(provider)
            .ok_or_else(|| AppError::unsupported_provider(provider))?;
        Ok((entry.factory)(config))
    }

    /// Verify that `model` belongs to `provider`'s catalog
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedProvider` for unknown providers and
    /// `UnsupportedModel` for a known provider with an uncatalogued model.
    pub fn validate_model(&self, provider: &str, model: &str) -> AppResult<()> {
        let entry = self
            .providers
            .get(provider)
            .ok_or_else(|| AppError::unsupported_provider(provider))?;
        if entry.info.model(model).is_none() {
            return Err(AppError::unsupported_model(model, provider));
        }
        Ok(())
    }

    /// Provider catalog, if registered
    #[must_use]
    pub fn provider_info(&self, provider: &str) -> Option<&ProviderInfo> {
        self.providers.get(provider).map(|entry| &entry.info)
    }

    /// Default model for `provider`
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedProvider` for unknown provider names.
    pub fn default_model(&self, provider: &str) -> AppResult<&'static str> {
        self.providers
            .get(provider)
            .map(|entry| entry.info.default_model)
            .ok_or_else(|| AppError::unsupported_provider(provider))
    }

    /// Catalog entry for `model` under `provider`, if both are known
    #[must_use]
    pub fn model_info(&self, provider: &str, model: &str) -> Option<&ModelInfo> {
        self.providers
            .get(provider)
            .and_then(|entry| entry.info.model(model))
    }

    /// Whether `provider` accepts `mime_type` attachments inline
    #[must_use]
    pub fn supports_attachment_type(&self, provider: &str, mime_type: &str) -> bool {
        self.providers.get(provider).is_some_and(|entry| {
            entry
                .info
                .supported_attachment_types
                .contains(&mime_type)
        })
    }

    /// Registered provider names, in no particular order
    #[must_use]
    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

const EFFORT_LEVELS: &[ReasoningEffort] = &[
    ReasoningEffort::Low,
    ReasoningEffort::Medium,
    ReasoningEffort::High,
];

fn google_catalog() -> ProviderInfo {
    ProviderInfo {
        name: "google",
        display_name: "Google Gemini",
        default_model: "gemini-2.5-flash-preview-05-20",
        supported_attachment_types: &[
            "image/png",
            "image/jpeg",
            "image/gif",
            "image/webp",
            "application/pdf",
            "text/plain",
            "text/html",
            "audio/wav",
            "audio/mp3",
            "audio/mpeg",
            "video/mp4",
            "video/mpeg",
            "video/quicktime",
        ],
        models: vec![
            ModelInfo::basic(
                "gemini-2.5-pro-preview-06-05",
                "Gemini 2.5 Pro",
                1_000_000,
                0.125,
                1.0,
            )
            .with_thinking(),
            ModelInfo::basic(
                "gemini-2.5-flash-preview-05-20",
                "Gemini 2.5 Flash (Thinking)",
                1_000_000,
                0.03,
                0.25,
            )
            .with_thinking()
            .with_search(),
            ModelInfo::basic(
                "gemini-2.5-flash-preview-05-20-non-thinking",
                "Gemini 2.5 Flash (Standard)",
                1_000_000,
                0.03,
                0.25,
            ),
            ModelInfo::basic(
                "gemini-2.5-flash-lite-preview-06-17",
                "Gemini 2.5 Flash Lite",
                1_000_000,
                0.01,
                0.04,
            )
            .with_thinking(),
        ],
    }
}

fn openai_catalog() -> ProviderInfo {
    ProviderInfo {
        name: "openai",
        display_name: "OpenAI GPT",
        default_model: "gpt-4o",
        supported_attachment_types: &["image/png", "image/jpeg", "image/gif", "image/webp"],
        models: vec![
            ModelInfo::basic("gpt-4o", "GPT-4o", 128_000, 0.25, 1.0),
            ModelInfo::basic("gpt-4o-mini", "GPT-4o Mini", 128_000, 0.015, 0.06),
            ModelInfo::basic("gpt-4.1", "GPT-4.1", 128_000, 0.2, 0.8),
            ModelInfo::basic("gpt-4.1-mini", "GPT-4.1 Mini", 128_000, 0.04, 0.16),
            ModelInfo::basic("gpt-4.1-nano", "GPT-4.1 Nano", 128_000, 0.01, 0.04),
            ModelInfo::basic("o3-2025-04-16", "OpenAI o3", 128_000, 0.2, 0.8)
                .with_thinking()
                .with_reasoning_effort(EFFORT_LEVELS, ReasoningEffort::Medium),
            ModelInfo::basic("o4-mini-2025-04-16", "OpenAI o4-mini", 128_000, 0.11, 0.44)
                .with_thinking()
                .with_reasoning_effort(EFFORT_LEVELS, ReasoningEffort::Medium),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn unknown_provider_is_rejected() {
        let registry = ProviderRegistry::standard();
        let err = registry
            .create("mystery", ProviderConfig::new("key"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedProvider);
    }

    #[test]
    fn unknown_model_for_known_provider_is_distinct_error() {
        let registry = ProviderRegistry::standard();
        let err = registry.validate_model("google", "gemini-9000").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedModel);

        let err = registry.validate_model("mystery", "gemini-9000").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedProvider);
    }

    #[test]
    fn catalog_models_validate() {
        let registry = ProviderRegistry::standard();
        for provider in ["google", "openai"] {
            let info = registry.provider_info(provider).unwrap();
            for model in &info.models {
                registry.validate_model(provider, model.id).unwrap();
            }
            registry
                .validate_model(provider, info.default_model)
                .unwrap();
        }
    }

    #[test]
    fn attachment_type_support_is_per_provider() {
        let registry = ProviderRegistry::standard();
        assert!(registry.supports_attachment_type("google", "application/pdf"));
        assert!(!registry.supports_attachment_type("openai", "application/pdf"));
        assert!(registry.supports_attachment_type("openai", "image/png"));
        assert!(!registry.supports_attachment_type("mystery", "image/png"));
    }

    #[test]
    fn reasoning_models_carry_effort_levels() {
        let registry = ProviderRegistry::standard();
        let info = registry.model_info("openai", "o3-2025-04-16").unwrap();
        assert!(info.supports_reasoning_effort);
        assert_eq!(info.default_reasoning_effort, Some(ReasoningEffort::Medium));
        assert_eq!(info.reasoning_effort_levels.len(), 3);

        let info = registry.model_info("openai", "gpt-4o").unwrap();
        assert!(!info.supports_reasoning_effort);
    }
}
