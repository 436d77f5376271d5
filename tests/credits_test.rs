// ABOUTME: Integration tests for credit metering and settlement
// ABOUTME: Validates markup, rounding, ledger descriptions, and floors
//
// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use durachat::config::BillingConfig;
use durachat::credits::CreditLedger;
use durachat::errors::ErrorCode;
use durachat::providers::{ProviderRegistry, UsageInfo};
use durachat::store::{ChatStore, LedgerContext, LedgerEntryType, SqliteStore};

async fn ledger() -> Result<(CreditLedger, Arc<SqliteStore>)> {
    let store = Arc::new(SqliteStore::in_memory().await?);
    let registry = Arc::new(ProviderRegistry::standard());
    let ledger = CreditLedger::new(
        Arc::clone(&store) as Arc<dyn ChatStore>,
        registry,
        BillingConfig::default(),
    );
    Ok((ledger, store))
}

fn usage(prompt: u32, completion: u32) -> UsageInfo {
    UsageInfo {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
        cost_cents: None,
        duration_ms: None,
    }
}

#[tokio::test]
async fn markup_applies_only_to_system_keys() -> Result<()> {
    let (ledger, _store) = ledger().await?;
    let usage = usage(10_000, 10_000);

    // gpt-4o: 0.25 + 1.0 cents per 1K, so 12.5 cents base
    let user_key = ledger.calculate_usage_cost("openai", "gpt-4o", &usage, true);
    let system_key = ledger.calculate_usage_cost("openai", "gpt-4o", &usage, false);

    assert_eq!(user_key, 13); // ceil(12.5)
    assert_eq!(system_key, 14); // ceil(12.5 * 1.05)
    assert!(system_key >= user_key);
    Ok(())
}

#[tokio::test]
async fn cost_ceils_once_after_markup() -> Result<()> {
    let (ledger, _store) = ledger().await?;
    // 1000/1000 tokens of an uncatalogued model: 10 + 20 = 30 cents base
    let cost = ledger.calculate_usage_cost("openai", "mystery-model", &usage(1000, 1000), false);
    assert_eq!(cost, 32); // ceil(30 * 1.05) = ceil(31.5)
    Ok(())
}

#[tokio::test]
async fn tiny_usage_still_charges_a_cent() -> Result<()> {
    let (ledger, _store) = ledger().await?;
    let cost = ledger.calculate_usage_cost(
        "google",
        "gemini-2.5-flash-preview-05-20",
        &usage(10, 10),
        false,
    );
    assert_eq!(cost, 1);
    Ok(())
}

#[tokio::test]
async fn deduction_writes_descriptive_ledger_entry() -> Result<()> {
    let (ledger, store) = ledger().await?;
    let user_id = Uuid::new_v4();
    store.ensure_settings(user_id).await?;
    store
        .add_balance(
            user_id,
            1000,
            LedgerEntryType::Topup,
            "topup",
            LedgerContext::default(),
        )
        .await?;

    let message_id = Uuid::new_v4();
    let entry = ledger
        .deduct_for_usage(
            user_id,
            "openai",
            "gpt-4o",
            &usage(10_000, 10_000),
            false,
            Some(message_id),
            None,
        )
        .await?;

    assert_eq!(entry.entry_type, LedgerEntryType::Usage);
    assert_eq!(entry.description, "AI usage - openai/gpt-4o");
    assert_eq!(entry.amount_cents, -14);
    assert_eq!(entry.balance_after_cents, 986);
    assert_eq!(entry.tokens_used, Some(20_000));
    assert_eq!(entry.message_id, Some(message_id));
    Ok(())
}

#[tokio::test]
async fn add_credits_rejects_usage_and_non_positive_amounts() -> Result<()> {
    let (ledger, store) = ledger().await?;
    let user_id = Uuid::new_v4();
    store.ensure_settings(user_id).await?;

    let err = ledger
        .add_credits(user_id, 100, LedgerEntryType::Usage, "bad")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);

    let err = ledger
        .add_credits(user_id, 0, LedgerEntryType::Topup, "bad")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);

    ledger
        .add_credits(user_id, 500, LedgerEntryType::Bonus, "signup bonus")
        .await?;
    assert_eq!(ledger.current_balance(user_id).await?, 500);
    Ok(())
}

#[tokio::test]
async fn preflight_floor_blocks_low_balances() -> Result<()> {
    let (ledger, store) = ledger().await?;
    let user_id = Uuid::new_v4();
    store.ensure_settings(user_id).await?;

    let err = ledger.check_preflight_floor(user_id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InsufficientCredits);

    ledger
        .add_credits(user_id, 5, LedgerEntryType::Topup, "topup")
        .await?;
    assert!(ledger.check_preflight_floor(user_id).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn history_is_newest_first() -> Result<()> {
    let (ledger, store) = ledger().await?;
    let user_id = Uuid::new_v4();
    store.ensure_settings(user_id).await?;

    ledger
        .add_credits(user_id, 100, LedgerEntryType::Topup, "first")
        .await?;
    ledger
        .add_credits(user_id, 200, LedgerEntryType::Bonus, "second")
        .await?;

    let history = ledger.history(user_id, 10, 0).await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].description, "second");
    assert_eq!(history[1].description, "first");
    Ok(())
}
