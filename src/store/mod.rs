// ABOUTME: Data model types and the persistence contracts the orchestrator consumes
// ABOUTME: ChatStore covers conversations, messages, usage, balances; BlobStore covers attachment bytes
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Conversation/Message Store
//!
//! The orchestrator treats persistence as a collaborator behind the
//! [`ChatStore`] trait. The contract is deliberately narrow: CRUD by id,
//! ordered listing, streaming-flag filters, an updated-since sync query,
//! and atomic balance mutations paired with ledger entries.
//!
//! Balance changes never happen through a bare field update. Every
//! mutation goes through `deduct_balance` or `add_balance`, which check,
//! apply, and append the ledger entry in one transaction.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedKeyMap;
use crate::errors::AppResult;
use crate::providers::MessageRole;

pub use sqlite::SqliteStore;

/// Title given to a conversation before its first user turn names it
pub const PLACEHOLDER_TITLE: &str = "New Chat";

/// A conversation thread and its provider/model selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Set when this conversation was forked from another
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_conversation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_point_order: Option<i64>,
    pub is_shared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh conversation with the placeholder title
    #[must_use]
    pub fn new(user_id: Uuid, provider: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: PLACEHOLDER_TITLE.to_owned(),
            provider: provider.into(),
            model: model.into(),
            system_prompt: None,
            parent_conversation_id: None,
            branch_point_order: None,
            is_shared: false,
            share_id: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the title is still a pre-first-turn placeholder
    #[must_use]
    pub fn has_placeholder_title(&self) -> bool {
        self.title == PLACEHOLDER_TITLE || self.title == "..."
    }
}

/// One message in a conversation, streamed into during a turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Reasoning trace, kept separate from the visible answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    /// Recorded per message since a conversation can switch providers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Position within the conversation, gapless from 0
    pub order: i64,
    pub is_streaming: bool,
    pub stream_completed: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// A completed user message at `order`
    #[must_use]
    pub fn user(conversation_id: Uuid, content: impl Into<String>, order: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::User,
            content: content.into(),
            thinking_content: None,
            provider: None,
            model: None,
            order,
            is_streaming: false,
            stream_completed: true,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// An empty assistant placeholder in the streaming state
    #[must_use]
    pub fn assistant_placeholder(
        conversation_id: Uuid,
        provider: impl Into<String>,
        model: impl Into<String>,
        order: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::Assistant,
            content: String::new(),
            thinking_content: None,
            provider: Some(provider.into()),
            model: Some(model.into()),
            order,
            is_streaming: true,
            stream_completed: false,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Token usage and cost for one completed assistant message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    /// Unique per message; created only after the stream completes
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_cents: i64,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    #[must_use]
    pub fn new(
        message_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        provider: impl Into<String>,
        model: impl Into<String>,
        usage: &crate::providers::UsageInfo,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id,
            conversation_id,
            user_id,
            provider: provider.into(),
            model: model.into(),
            prompt_tokens: i64::from(usage.prompt_tokens),
            completion_tokens: i64::from(usage.completion_tokens),
            total_tokens: i64::from(usage.total_tokens),
            cost_cents: i64::from(usage.cost_cents.unwrap_or(0)),
            created_at: Utc::now(),
        }
    }
}

/// Kind of balance mutation recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryType {
    Usage,
    Topup,
    Refund,
    Bonus,
}

impl LedgerEntryType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Topup => "topup",
            Self::Refund => "refund",
            Self::Bonus => "bonus",
        }
    }
}

/// Immutable record of one balance mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub entry_type: LedgerEntryType,
    /// Signed delta in cents; negative for usage deductions
    pub amount_cents: i64,
    pub balance_after_cents: i64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Billing context attached to a usage ledger entry
#[derive(Debug, Clone, Default)]
pub struct LedgerContext {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub tokens_used: Option<i64>,
    pub message_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
}

/// Per-user settings: balance and encrypted API key material
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub user_id: Uuid,
    pub balance_cents: i64,
    pub encrypted_api_keys: EncryptedKeyMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata for an uploaded attachment; bytes live in the blob store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Bound to the user message that carried it, once known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    /// Key into the blob store
    pub blob_key: String,
    pub created_at: DateTime<Utc>,
}

/// Result of an updated-since sync pull
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncData {
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
}

/// Persistence contract for conversations, messages, usage, and balances
#[async_trait]
pub trait ChatStore: Send + Sync {
    // --- conversations ---

    async fn create_conversation(&self, conversation: &Conversation) -> AppResult<()>;
    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>>;
    async fn list_conversations(&self, user_id: Uuid) -> AppResult<Vec<Conversation>>;
    async fn update_conversation_title(&self, id: Uuid, title: &str) -> AppResult<()>;
    async fn update_conversation_provider(
        &self,
        id: Uuid,
        provider: &str,
        model: &str,
    ) -> AppResult<()>;
    /// Soft delete: flips the flag, rows stay queryable for sync
    async fn delete_conversation(&self, id: Uuid) -> AppResult<()>;

    // --- messages ---

    async fn create_message(&self, message: &Message) -> AppResult<()>;
    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>>;
    /// Messages of a conversation ordered by `order`, soft-deleted excluded
    async fn list_messages(&self, conversation_id: Uuid) -> AppResult<Vec<Message>>;
    /// Count of all messages ever created in the conversation, used for
    /// order assignment (soft-deleted rows still occupy their order slot)
    async fn message_count(&self, conversation_id: Uuid) -> AppResult<i64>;
    /// Messages currently flagged as streaming
    async fn streaming_messages(&self, conversation_id: Uuid) -> AppResult<Vec<Message>>;
    async fn append_message_content(&self, id: Uuid, delta: &str) -> AppResult<()>;
    async fn append_message_thinking(&self, id: Uuid, delta: &str) -> AppResult<()>;
    /// Terminal update for a turn; success is (false, true), failure (false, false)
    async fn set_message_stream_state(
        &self,
        id: Uuid,
        is_streaming: bool,
        stream_completed: bool,
    ) -> AppResult<()>;

    // --- usage ---

    async fn create_usage_record(&self, record: &UsageRecord) -> AppResult<()>;
    async fn usage_for_message(&self, message_id: Uuid) -> AppResult<Option<UsageRecord>>;

    // --- sync ---

    /// Conversations and messages updated strictly after `since` (all rows
    /// when `since` is `None`), including soft-deleted ones so clients can
    /// tombstone locally
    async fn sync_since(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<SyncData>;

    /// Hard delete of everything the user owns
    async fn clear_all(&self, user_id: Uuid) -> AppResult<()>;

    // --- settings and balance ---

    async fn get_settings(&self, user_id: Uuid) -> AppResult<Option<UserSettings>>;
    /// Fetch settings, creating a zero-balance row if absent
    async fn ensure_settings(&self, user_id: Uuid) -> AppResult<UserSettings>;
    async fn save_encrypted_keys(&self, user_id: Uuid, keys: &EncryptedKeyMap) -> AppResult<()>;
    async fn current_balance(&self, user_id: Uuid) -> AppResult<i64>;

    /// Atomically verify sufficiency, decrement the balance, and append a
    /// usage ledger entry
    ///
    /// # Errors
    ///
    /// Fails with `InsufficientCredits` when the balance cannot cover
    /// `amount_cents` at commit time, leaving balance and ledger untouched.
    async fn deduct_balance(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        description: &str,
        context: LedgerContext,
    ) -> AppResult<LedgerEntry>;

    /// Atomically increment the balance and append a ledger entry
    async fn add_balance(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        entry_type: LedgerEntryType,
        description: &str,
        context: LedgerContext,
    ) -> AppResult<LedgerEntry>;

    /// Ledger entries for a user, newest first
    async fn ledger_history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<LedgerEntry>>;

    // --- attachments ---

    async fn create_attachment(&self, attachment: &Attachment) -> AppResult<()>;
    async fn attachments_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> AppResult<Vec<Attachment>>;
    async fn bind_attachment_to_message(
        &self,
        attachment_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<()>;

    // --- session bindings ---

    /// Persist (or clear, with `None`) the conversation a session views
    async fn bind_session(&self, session_id: &str, conversation_id: Option<Uuid>) -> AppResult<()>;
    async fn session_conversation(&self, session_id: &str) -> AppResult<Option<Uuid>>;
}

/// Byte storage for attachment content, keyed by the attachment's blob key
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AppResult<()>;
}
