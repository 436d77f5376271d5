// ABOUTME: Pricing engine converting token usage into cost in cents
// ABOUTME: Catalog-driven with a conservative default for uncatalogued models
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Pricing Engine
//!
//! Pure cost arithmetic over the registry's per-model pricing table.
//! Billing degrades gracefully: a model with no published pricing gets a
//! conservative default estimate rather than an error, so pricing gaps
//! never block a response.
//!
//! Rounding policy: the aggregate (prompt + completion) cost is rounded to
//! whole cents exactly once. Rounding the components separately would
//! systematically overcharge.

use crate::providers::{ProviderRegistry, UsageInfo};

/// Default prompt pricing for unknown models, cents per 1K tokens
const DEFAULT_PROMPT_COST_PER_1K: f64 = 10.0;

/// Default completion pricing for unknown models, cents per 1K tokens
const DEFAULT_COMPLETION_COST_PER_1K: f64 = 20.0;

/// Per-token pricing in fractional cents
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostPerToken {
    pub prompt_token_cost: f64,
    pub completion_token_cost: f64,
}

/// Per-1K pricing for `model`, falling back to the conservative default
fn pricing_per_1k(registry: &ProviderRegistry, provider: &str, model: &str) -> (f64, f64) {
    registry
        .model_info(provider, model)
        .and_then(|info| Some((info.prompt_cost_per_1k?, info.completion_cost_per_1k?)))
        .unwrap_or((DEFAULT_PROMPT_COST_PER_1K, DEFAULT_COMPLETION_COST_PER_1K))
}

/// Cost of a completed turn in whole cents
///
/// The aggregate is rounded once, to the nearest cent.
#[must_use]
pub fn calculate_cost(
    registry: &ProviderRegistry,
    provider: &str,
    model: &str,
    prompt_tokens: u32,
    completion_tokens: u32,
) -> u32 {
    let (prompt_per_1k, completion_per_1k) = pricing_per_1k(registry, provider, model);

    let prompt_cost = f64::from(prompt_tokens) / 1000.0 * prompt_per_1k;
    let completion_cost = f64::from(completion_tokens) / 1000.0 * completion_per_1k;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        (prompt_cost + completion_cost).round() as u32
    }
}

/// Cost of a usage report in whole cents
#[must_use]
pub fn calculate_usage(
    registry: &ProviderRegistry,
    provider: &str,
    model: &str,
    usage: &UsageInfo,
) -> u32 {
    calculate_cost(
        registry,
        provider,
        model,
        usage.prompt_tokens,
        usage.completion_tokens,
    )
}

/// Per-token pricing in fractional cents for `provider`/`model`
#[must_use]
pub fn cost_per_token(registry: &ProviderRegistry, provider: &str, model: &str) -> CostPerToken {
    let (prompt_per_1k, completion_per_1k) = pricing_per_1k(registry, provider, model);
    CostPerToken {
        prompt_token_cost: prompt_per_1k / 1000.0,
        completion_token_cost: completion_per_1k / 1000.0,
    }
}
