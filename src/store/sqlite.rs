// ABOUTME: SQLite implementation of the ChatStore and BlobStore contracts
// ABOUTME: Schema bootstrap, row mapping, and transactional balance mutations
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # SQLite Store
//!
//! Backs the persistence contracts with `sqlx` over SQLite. The schema is
//! created at startup. Balance deductions use a guarded single-statement
//! update (`WHERE balance_cents >= ?`) inside the same transaction as the
//! ledger insert, so a concurrent race can never drive the balance
//! negative or leave a ledger entry without its balance change.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::EncryptedKeyMap;
use crate::errors::{AppError, AppResult};
use crate::providers::MessageRole;

use super::{
    Attachment, BlobStore, ChatStore, Conversation, LedgerContext, LedgerEntry, LedgerEntryType,
    Message, SyncData, UsageRecord, UserSettings,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    system_prompt TEXT,
    parent_conversation_id TEXT,
    branch_point_order INTEGER,
    is_shared INTEGER NOT NULL DEFAULT 0,
    share_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, updated_at);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    thinking_content TEXT,
    provider TEXT,
    model TEXT,
    message_order INTEGER NOT NULL,
    is_streaming INTEGER NOT NULL DEFAULT 0,
    stream_completed INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(conversation_id, message_order)
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, message_order);

CREATE TABLE IF NOT EXISTS usage_records (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    cost_cents INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_settings (
    user_id TEXT PRIMARY KEY,
    balance_cents INTEGER NOT NULL DEFAULT 0,
    encrypted_api_keys TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS credit_ledger (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    entry_type TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    balance_after_cents INTEGER NOT NULL,
    description TEXT NOT NULL,
    provider TEXT,
    model TEXT,
    tokens_used INTEGER,
    message_id TEXT,
    conversation_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_user ON credit_ledger(user_id, created_at);

CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    message_id TEXT,
    file_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    blob_key TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attachments_conversation ON attachments(conversation_id);

CREATE TABLE IF NOT EXISTS session_bindings (
    session_id TEXT PRIMARY KEY,
    conversation_id TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blobs (
    blob_key TEXT PRIMARY KEY,
    content_type TEXT NOT NULL,
    bytes BLOB NOT NULL
);
";

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and bootstrap the schema
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// statements fail.
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AppError::config(format!("invalid database URL: {e}")))?
            .create_if_missing(true);

        // In-memory databases vanish per connection; pin them to one
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(database_url, "SQLite store ready");
        Ok(store)
    }

    /// In-memory store for tests
    ///
    /// # Errors
    ///
    /// Returns an error if the schema statements fail.
    pub async fn in_memory() -> AppResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> AppResult<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("schema migrated");
        Ok(())
    }
}

fn parse_uuid(value: &str) -> AppResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| AppError::database(format!("malformed uuid in database: {e}")))
}

fn parse_opt_uuid(value: Option<String>) -> AppResult<Option<Uuid>> {
    value.as_deref().map(parse_uuid).transpose()
}

fn parse_role(value: &str) -> AppResult<MessageRole> {
    match value {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        "system" => Ok(MessageRole::System),
        other => Err(AppError::database(format!("unknown message role: {other}"))),
    }
}

fn parse_entry_type(value: &str) -> AppResult<LedgerEntryType> {
    match value {
        "usage" => Ok(LedgerEntryType::Usage),
        "topup" => Ok(LedgerEntryType::Topup),
        "refund" => Ok(LedgerEntryType::Refund),
        "bonus" => Ok(LedgerEntryType::Bonus),
        other => Err(AppError::database(format!("unknown ledger type: {other}"))),
    }
}

fn row_to_conversation(row: &SqliteRow) -> AppResult<Conversation> {
    Ok(Conversation {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(&row.try_get::<String, _>("user_id")?)?,
        title: row.try_get("title")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        system_prompt: row.try_get("system_prompt")?,
        parent_conversation_id: parse_opt_uuid(row.try_get("parent_conversation_id")?)?,
        branch_point_order: row.try_get("branch_point_order")?,
        is_shared: row.try_get("is_shared")?,
        share_id: row.try_get("share_id")?,
        deleted: row.try_get("deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_message(row: &SqliteRow) -> AppResult<Message> {
    Ok(Message {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        conversation_id: parse_uuid(&row.try_get::<String, _>("conversation_id")?)?,
        role: parse_role(&row.try_get::<String, _>("role")?)?,
        content: row.try_get("content")?,
        thinking_content: row.try_get("thinking_content")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        order: row.try_get("message_order")?,
        is_streaming: row.try_get("is_streaming")?,
        stream_completed: row.try_get("stream_completed")?,
        deleted: row.try_get("deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_usage(row: &SqliteRow) -> AppResult<UsageRecord> {
    Ok(UsageRecord {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        message_id: parse_uuid(&row.try_get::<String, _>("message_id")?)?,
        conversation_id: parse_uuid(&row.try_get::<String, _>("conversation_id")?)?,
        user_id: parse_uuid(&row.try_get::<String, _>("user_id")?)?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
        cost_cents: row.try_get("cost_cents")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_ledger_entry(row: &SqliteRow) -> AppResult<LedgerEntry> {
    Ok(LedgerEntry {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(&row.try_get::<String, _>("user_id")?)?,
        entry_type: parse_entry_type(&row.try_get::<String, _>("entry_type")?)?,
        amount_cents: row.try_get("amount_cents")?,
        balance_after_cents: row.try_get("balance_after_cents")?,
        description: row.try_get("description")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        tokens_used: row.try_get("tokens_used")?,
        message_id: parse_opt_uuid(row.try_get("message_id")?)?,
        conversation_id: parse_opt_uuid(row.try_get("conversation_id")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_attachment(row: &SqliteRow) -> AppResult<Attachment> {
    Ok(Attachment {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        conversation_id: parse_uuid(&row.try_get::<String, _>("conversation_id")?)?,
        message_id: parse_opt_uuid(row.try_get("message_id")?)?,
        file_name: row.try_get("file_name")?,
        mime_type: row.try_get("mime_type")?,
        size_bytes: row.try_get("size_bytes")?,
        blob_key: row.try_get("blob_key")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_ledger_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &LedgerEntry,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO credit_ledger (id, user_id, entry_type, amount_cents, balance_after_cents,
             description, provider, model, tokens_used, message_id, conversation_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.id.to_string())
    .bind(entry.user_id.to_string())
    .bind(entry.entry_type.as_str())
    .bind(entry.amount_cents)
    .bind(entry.balance_after_cents)
    .bind(&entry.description)
    .bind(entry.provider.as_deref())
    .bind(entry.model.as_deref())
    .bind(entry.tokens_used)
    .bind(entry.message_id.map(|id| id.to_string()))
    .bind(entry.conversation_id.map(|id| id.to_string()))
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_conversation(&self, conversation: &Conversation) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, provider, model, system_prompt,
                 parent_conversation_id, branch_point_order, is_shared, share_id, deleted,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conversation.id.to_string())
        .bind(conversation.user_id.to_string())
        .bind(&conversation.title)
        .bind(&conversation.provider)
        .bind(&conversation.model)
        .bind(conversation.system_prompt.as_deref())
        .bind(conversation.parent_conversation_id.map(|id| id.to_string()))
        .bind(conversation.branch_point_order)
        .bind(conversation.is_shared)
        .bind(conversation.share_id.as_deref())
        .bind(conversation.deleted)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn list_conversations(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE user_id = ? AND deleted = 0
             ORDER BY updated_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_conversation).collect()
    }

    async fn update_conversation_title(&self, id: Uuid, title: &str) -> AppResult<()> {
        sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_conversation_provider(
        &self,
        id: Uuid,
        provider: &str,
        model: &str,
    ) -> AppResult<()> {
        sqlx::query("UPDATE conversations SET provider = ?, model = ?, updated_at = ? WHERE id = ?")
            .bind(provider)
            .bind(model)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_conversation(&self, id: Uuid) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query("UPDATE conversations SET deleted = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE messages SET deleted = 1, updated_at = ? WHERE conversation_id = ?")
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_message(&self, message: &Message) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, thinking_content,
                 provider, model, message_order, is_streaming, stream_completed, deleted,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.conversation_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.thinking_content.as_deref())
        .bind(message.provider.as_deref())
        .bind(message.model.as_deref())
        .bind(message.order)
        .bind(message.is_streaming)
        .bind(message.stream_completed)
        .bind(message.deleted)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> AppResult<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn list_messages(&self, conversation_id: Uuid) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? AND deleted = 0
             ORDER BY message_order ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn message_count(&self, conversation_id: Uuid) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn streaming_messages(&self, conversation_id: Uuid) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? AND is_streaming = 1 AND deleted = 0
             ORDER BY message_order ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn append_message_content(&self, id: Uuid, delta: &str) -> AppResult<()> {
        sqlx::query("UPDATE messages SET content = content || ?, updated_at = ? WHERE id = ?")
            .bind(delta)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_message_thinking(&self, id: Uuid, delta: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE messages SET thinking_content = COALESCE(thinking_content, '') || ?,
                 updated_at = ? WHERE id = ?",
        )
        .bind(delta)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_message_stream_state(
        &self,
        id: Uuid,
        is_streaming: bool,
        stream_completed: bool,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE messages SET is_streaming = ?, stream_completed = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(is_streaming)
        .bind(stream_completed)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_usage_record(&self, record: &UsageRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO usage_records (id, message_id, conversation_id, user_id, provider,
                 model, prompt_tokens, completion_tokens, total_tokens, cost_cents, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.message_id.to_string())
        .bind(record.conversation_id.to_string())
        .bind(record.user_id.to_string())
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.prompt_tokens)
        .bind(record.completion_tokens)
        .bind(record.total_tokens)
        .bind(record.cost_cents)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_for_message(&self, message_id: Uuid) -> AppResult<Option<UsageRecord>> {
        let row = sqlx::query("SELECT * FROM usage_records WHERE message_id = ?")
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_usage).transpose()
    }

    async fn sync_since(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<SyncData> {
        let since = since.unwrap_or(DateTime::<Utc>::MIN_UTC);

        let conversation_rows = sqlx::query(
            "SELECT * FROM conversations WHERE user_id = ? AND updated_at > ?
             ORDER BY updated_at ASC",
        )
        .bind(user_id.to_string())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let conversations: Vec<Conversation> = conversation_rows
            .iter()
            .map(row_to_conversation)
            .collect::<AppResult<_>>()?;

        let message_rows = sqlx::query(
            "SELECT m.* FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.user_id = ? AND m.updated_at > ?
             ORDER BY m.updated_at ASC",
        )
        .bind(user_id.to_string())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let messages: Vec<Message> = message_rows
            .iter()
            .map(row_to_message)
            .collect::<AppResult<_>>()?;

        Ok(SyncData {
            conversations,
            messages,
        })
    }

    async fn clear_all(&self, user_id: Uuid) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let user = user_id.to_string();

        sqlx::query(
            "DELETE FROM blobs WHERE blob_key IN (
                 SELECT a.blob_key FROM attachments a
                 JOIN conversations c ON c.id = a.conversation_id
                 WHERE c.user_id = ?)",
        )
        .bind(&user)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM attachments WHERE conversation_id IN (
                 SELECT id FROM conversations WHERE user_id = ?)",
        )
        .bind(&user)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM usage_records WHERE user_id = ?")
            .bind(&user)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM messages WHERE conversation_id IN (
                 SELECT id FROM conversations WHERE user_id = ?)",
        )
        .bind(&user)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM session_bindings WHERE conversation_id IN (
                 SELECT id FROM conversations WHERE user_id = ?)",
        )
        .bind(&user)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM conversations WHERE user_id = ?")
            .bind(&user)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(%user_id, "cleared all conversation data");
        Ok(())
    }

    async fn get_settings(&self, user_id: Uuid) -> AppResult<Option<UserSettings>> {
        let row = sqlx::query("SELECT * FROM user_settings WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let keys_json: String = row.try_get("encrypted_api_keys")?;
        let encrypted_api_keys: EncryptedKeyMap = serde_json::from_str(&keys_json)?;

        Ok(Some(UserSettings {
            user_id,
            balance_cents: row.try_get("balance_cents")?,
            encrypted_api_keys,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn ensure_settings(&self, user_id: Uuid) -> AppResult<UserSettings> {
        let now = Utc::now();
        sqlx::query(
            "INSERT OR IGNORE INTO user_settings (user_id, balance_cents, encrypted_api_keys,
                 created_at, updated_at)
             VALUES (?, 0, '{}', ?, ?)",
        )
        .bind(user_id.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_settings(user_id)
            .await?
            .ok_or_else(|| AppError::database("settings row vanished after ensure"))
    }

    async fn save_encrypted_keys(&self, user_id: Uuid, keys: &EncryptedKeyMap) -> AppResult<()> {
        self.ensure_settings(user_id).await?;
        sqlx::query(
            "UPDATE user_settings SET encrypted_api_keys = ?, updated_at = ? WHERE user_id = ?",
        )
        .bind(serde_json::to_string(keys)?)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_balance(&self, user_id: Uuid) -> AppResult<i64> {
        let row = sqlx::query("SELECT balance_cents FROM user_settings WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map_or(Ok(0), |r| r.try_get("balance_cents"))?)
    }

    async fn deduct_balance(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        description: &str,
        context: LedgerContext,
    ) -> AppResult<LedgerEntry> {
        if amount_cents < 0 {
            return Err(AppError::invalid_input("deduction amount must be >= 0"));
        }

        let mut tx = self.pool.begin().await?;

        // Guarded decrement: the sufficiency check and the write are one
        // statement, so concurrent deductions cannot both pass a stale read
        let result = sqlx::query(
            "UPDATE user_settings SET balance_cents = balance_cents - ?, updated_at = ?
             WHERE user_id = ? AND balance_cents >= ?",
        )
        .bind(amount_cents)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .bind(amount_cents)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let balance: Option<i64> =
                sqlx::query("SELECT balance_cents FROM user_settings WHERE user_id = ?")
                    .bind(user_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?
                    .map(|r| r.try_get("balance_cents"))
                    .transpose()?;
            let available = balance.ok_or_else(|| {
                AppError::not_found(format!("settings for user {user_id}"))
            })?;
            return Err(AppError::insufficient_credits(format!(
                "required {amount_cents} cents, available {available}"
            ))
            .with_user_id(user_id));
        }

        let balance_after: i64 =
            sqlx::query("SELECT balance_cents FROM user_settings WHERE user_id = ?")
                .bind(user_id.to_string())
                .fetch_one(&mut *tx)
                .await?
                .try_get("balance_cents")?;

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            entry_type: LedgerEntryType::Usage,
            amount_cents: -amount_cents,
            balance_after_cents: balance_after,
            description: description.to_owned(),
            provider: context.provider,
            model: context.model,
            tokens_used: context.tokens_used,
            message_id: context.message_id,
            conversation_id: context.conversation_id,
            created_at: Utc::now(),
        };
        insert_ledger_entry(&mut tx, &entry).await?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn add_balance(
        &self,
        user_id: Uuid,
        amount_cents: i64,
        entry_type: LedgerEntryType,
        description: &str,
        context: LedgerContext,
    ) -> AppResult<LedgerEntry> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE user_settings SET balance_cents = balance_cents + ?, updated_at = ?
             WHERE user_id = ?",
        )
        .bind(amount_cents)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("settings for user {user_id}")));
        }

        let balance_after: i64 =
            sqlx::query("SELECT balance_cents FROM user_settings WHERE user_id = ?")
                .bind(user_id.to_string())
                .fetch_one(&mut *tx)
                .await?
                .try_get("balance_cents")?;

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            entry_type,
            amount_cents,
            balance_after_cents: balance_after,
            description: description.to_owned(),
            provider: context.provider,
            model: context.model,
            tokens_used: context.tokens_used,
            message_id: context.message_id,
            conversation_id: context.conversation_id,
            created_at: Utc::now(),
        };
        insert_ledger_entry(&mut tx, &entry).await?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn ledger_history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM credit_ledger WHERE user_id = ?
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_ledger_entry).collect()
    }

    async fn create_attachment(&self, attachment: &Attachment) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO attachments (id, conversation_id, message_id, file_name, mime_type,
                 size_bytes, blob_key, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attachment.id.to_string())
        .bind(attachment.conversation_id.to_string())
        .bind(attachment.message_id.map(|id| id.to_string()))
        .bind(&attachment.file_name)
        .bind(&attachment.mime_type)
        .bind(attachment.size_bytes)
        .bind(&attachment.blob_key)
        .bind(attachment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attachments_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> AppResult<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT * FROM attachments WHERE conversation_id = ? ORDER BY created_at ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_attachment).collect()
    }

    async fn bind_attachment_to_message(
        &self,
        attachment_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query("UPDATE attachments SET message_id = ? WHERE id = ?")
            .bind(message_id.to_string())
            .bind(attachment_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bind_session(
        &self,
        session_id: &str,
        conversation_id: Option<Uuid>,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO session_bindings (session_id, conversation_id, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET conversation_id = excluded.conversation_id,
                 updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(conversation_id.map(|id| id.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn session_conversation(&self, session_id: &str) -> AppResult<Option<Uuid>> {
        let row = sqlx::query("SELECT conversation_id FROM session_bindings WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        parse_opt_uuid(row.try_get("conversation_id")?)
    }
}

#[async_trait]
impl BlobStore for SqliteStore {
    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT bytes FROM blobs WHERE blob_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("bytes")).transpose()?)
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO blobs (blob_key, content_type, bytes) VALUES (?, ?, ?)
             ON CONFLICT(blob_key) DO UPDATE SET content_type = excluded.content_type,
                 bytes = excluded.bytes",
        )
        .bind(key)
        .bind(content_type)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
