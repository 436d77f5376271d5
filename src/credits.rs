// ABOUTME: Credit ledger: usage cost calculation with markup, atomic deduction, top-ups
// ABOUTME: All balance mutations flow through the store's transactional balance ops
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Credit Ledger
//!
//! Converts completed usage into a charge and settles it against the
//! user's balance. Usage billed through a system key carries a flat
//! percentage markup (5% unless configured otherwise); a user's own key
//! is never marked up. Charges are ceiled to whole cents so the platform
//! never undercharges on fractions.
//!
//! Sufficiency is re-checked inside the store transaction at commit
//! time. A pre-flight pass is advisory only; the balance can change
//! between request start and stream completion.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::BillingConfig;
use crate::errors::{AppError, AppResult};
use crate::pricing;
use crate::providers::{ProviderRegistry, UsageInfo};
use crate::store::{ChatStore, LedgerContext, LedgerEntry, LedgerEntryType};

use uuid::Uuid;

/// Billing front-end over the store's atomic balance operations
pub struct CreditLedger {
    store: Arc<dyn ChatStore>,
    registry: Arc<ProviderRegistry>,
    billing: BillingConfig,
}

impl CreditLedger {
    #[must_use]
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ProviderRegistry>,
        billing: BillingConfig,
    ) -> Self {
        Self {
            store,
            registry,
            billing,
        }
    }

    /// Charge for a usage report, in whole cents
    ///
    /// Base cost comes from per-token pricing; system-key usage is marked
    /// up before the single ceiling to integer cents.
    #[must_use]
    pub fn calculate_usage_cost(
        &self,
        provider: &str,
        model: &str,
        usage: &UsageInfo,
        is_user_key: bool,
    ) -> i64 {
        let per_token = pricing::cost_per_token(&self.registry, provider, model);
        let mut cost_cents = f64::from(usage.prompt_tokens) * per_token.prompt_token_cost
            + f64::from(usage.completion_tokens) * per_token.completion_token_cost;

        if !is_user_key {
            cost_cents *= 1.0 + f64::from(self.billing.markup_percent) / 100.0;
        }

        #[allow(clippy::cast_possible_truncation)]
        let charged = cost_cents.ceil() as i64;

        debug!(
            provider,
            model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost_cents = charged,
            markup_applied = !is_user_key,
            "usage cost calculated"
        );

        charged
    }

    /// Settle a completed turn against the user's balance
    ///
    /// # Errors
    ///
    /// Returns `InsufficientCredits` when the balance cannot cover the
    /// charge at commit time; balance and ledger are left untouched.
    pub async fn deduct_for_usage(
        &self,
        user_id: Uuid,
        provider: &str,
        model: &str,
        usage: &UsageInfo,
        is_user_key: bool,
        message_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> AppResult<LedgerEntry> {
        let cost_cents = self.calculate_usage_cost(provider, model, usage, is_user_key);

        let entry = self
            .store
            .deduct_balance(
                user_id,
                cost_cents,
                &format!("AI usage - {provider}/{model}"),
                LedgerContext {
                    provider: Some(provider.to_owned()),
                    model: Some(model.to_owned()),
                    tokens_used: Some(i64::from(usage.total_tokens)),
                    message_id,
                    conversation_id,
                },
            )
            .await?;

        info!(
            %user_id,
            provider,
            model,
            cost_cents,
            new_balance = entry.balance_after_cents,
            "credits deducted for usage"
        );

        Ok(entry)
    }

    /// Credit the user's balance from an external trigger
    ///
    /// # Errors
    ///
    /// Rejects non-positive amounts and `Usage` entry types; those only
    /// arrive through [`Self::deduct_for_usage`].
    pub async fn add_credits(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        entry_type: LedgerEntryType,
        description: &str,
    ) -> AppResult<LedgerEntry> {
        if entry_type == LedgerEntryType::Usage {
            return Err(AppError::invalid_input(
                "usage entries are recorded by deduction, not add_credits",
            ));
        }
        if amount_cents <= 0 {
            return Err(AppError::invalid_input("credit amount must be positive"));
        }

        let entry = self
            .store
            .add_balance(
                user_id,
                amount_cents,
                entry_type,
                description,
                LedgerContext::default(),
            )
            .await?;

        info!(
            %user_id,
            amount_cents,
            entry_type = entry_type.as_str(),
            new_balance = entry.balance_after_cents,
            "credits added"
        );

        Ok(entry)
    }

    /// Advisory pre-flight check before a system-key stream starts
    ///
    /// Uses a fixed floor regardless of the selected model; the
    /// authoritative check happens at settlement.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientCredits` when the balance is below the floor.
    pub async fn check_preflight_floor(&self, user_id: Uuid) -> AppResult<()> {
        let balance = self.store.current_balance(user_id).await?;
        let floor = self.billing.preflight_floor_cents;
        if balance < floor {
            return Err(AppError::insufficient_credits(format!(
                "balance {balance} cents is below the {floor} cent minimum"
            ))
            .with_user_id(user_id));
        }
        Ok(())
    }

    /// Ledger entries for a user, newest first
    pub async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<LedgerEntry>> {
        self.store.ledger_history(user_id, limit, offset).await
    }

    /// Current balance in cents
    pub async fn current_balance(&self, user_id: Uuid) -> AppResult<i64> {
        self.store.current_balance(user_id).await
    }
}
