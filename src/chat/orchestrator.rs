// ABOUTME: Top-level chat turn state machine from prompt to settled credits
// ABOUTME: Demultiplexes adapter streams into batched persistence and live events
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Chat Orchestrator
//!
//! Drives one chat turn end to end: conversation and message rows, key
//! resolution, the provider stream, fan-out to live connections, and
//! credit settlement.
//!
//! Batching policy: answer tokens reach connections unbatched but are
//! persisted in groups; thinking tokens are batched for both persistence
//! and delivery, except for adapters that forward thinking per token
//! upstream, which stay unbatched on the wire.
//!
//! A dropped client connection does not cancel the turn. The stream runs
//! to completion and persists; events with no live viewer are dropped.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use futures_util::StreamExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{BillingConfig, StreamingConfig};
use crate::credits::CreditLedger;
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::pricing;
use crate::providers::{
    ChatMessage, KeyResolution, KeyResolver, MessageContent, MessageRole, ProviderConfig,
    ProviderRegistry, ReasoningEffort, StreamEvent, StreamRequest, UsageInfo,
};
use crate::session::SessionRegistry;
use crate::store::{Attachment, BlobStore, ChatStore, Conversation, Message, UsageRecord};

use super::events::ServerEvent;

/// Provider used when a new conversation names none
const DEFAULT_PROVIDER: &str = "google";

/// Derived titles are cut to this many characters
const TITLE_MAX_CHARS: usize = 50;

/// Attachments above this size are never inlined upstream
const MAX_INLINE_ATTACHMENT_BYTES: i64 = 10 * 1024 * 1024;

/// Character cap for text excerpts of non-inlinable attachments
const TEXT_EXCERPT_MAX_CHARS: usize = 4000;

/// One inbound `start_chat` command, resolved to its connection
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub connection_id: Uuid,
    pub session_id: String,
    /// Authenticated user; anonymous sessions are stored under a
    /// session-derived owner id and never billed
    pub user_id: Option<Uuid>,
    pub prompt: String,
    pub conversation_id: Option<Uuid>,
    /// Client-supplied id for the user message row
    pub message_id: Option<Uuid>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl TurnRequest {
    /// Storage owner for this turn's rows
    #[must_use]
    pub fn owner_id(&self) -> Uuid {
        self.user_id
            .unwrap_or_else(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, self.session_id.as_bytes()))
    }
}

/// Releases the per-conversation turn lock when the turn ends
struct TurnGuard {
    active: Arc<DashMap<Uuid, ()>>,
    conversation_id: Uuid,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.active.remove(&self.conversation_id);
    }
}

/// Orchestrates chat turns against the store, registry, and sessions
pub struct ChatOrchestrator {
    store: Arc<dyn ChatStore>,
    blobs: Arc<dyn BlobStore>,
    registry: Arc<ProviderRegistry>,
    resolver: Arc<KeyResolver>,
    credits: Arc<CreditLedger>,
    sessions: Arc<SessionRegistry>,
    billing: BillingConfig,
    streaming: StreamingConfig,
    active_turns: Arc<DashMap<Uuid, ()>>,
}

impl ChatOrchestrator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ChatStore>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<ProviderRegistry>,
        resolver: Arc<KeyResolver>,
        credits: Arc<CreditLedger>,
        sessions: Arc<SessionRegistry>,
        billing: BillingConfig,
        streaming: StreamingConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            registry,
            resolver,
            credits,
            sessions,
            billing,
            streaming,
            active_turns: Arc::new(DashMap::new()),
        }
    }

    /// Run a chat turn, reporting any failure to the sender as an `error`
    /// event
    pub async fn start_chat(&self, turn: TurnRequest) {
        let connection_id = turn.connection_id;
        if let Err(e) = self.run_turn(turn).await {
            warn!(%connection_id, error = %e, "chat turn failed");
            if let Err(send_err) = self.sessions.send_to(
                connection_id,
                &ServerEvent::Error {
                    message: e.to_string(),
                },
            ) {
                error!(%connection_id, error = %send_err, "failed to deliver error event");
            }
        }
    }

    #[instrument(skip(self, turn), fields(session_id = %turn.session_id))]
    async fn run_turn(&self, turn: TurnRequest) -> AppResult<()> {
        let owner_id = turn.owner_id();

        let mut conversation = self.resolve_conversation(&turn, owner_id).await?;
        self.registry
            .validate_model(&conversation.provider, &conversation.model)?;

        // One streaming turn per conversation at a time
        let _guard = self.acquire_turn_lock(conversation.id)?;

        // Point the initiating connection at the conversation; untagged
        // tabs of the same session follow the binding
        self.sessions
            .set_conversation(turn.connection_id, Some(conversation.id));
        self.sessions
            .adopt_session_connections(&turn.session_id, conversation.id);
        self.store
            .bind_session(&turn.session_id, Some(conversation.id))
            .await?;

        let next_order = self.store.message_count(conversation.id).await?;
        let mut user_message = Message::user(conversation.id, turn.prompt.clone(), next_order);
        if let Some(id) = turn.message_id {
            user_message.id = id;
        }
        self.store.create_message(&user_message).await?;

        if conversation.has_placeholder_title() {
            let title = derive_title(&turn.prompt);
            self.store
                .update_conversation_title(conversation.id, &title)
                .await?;
            conversation.title = title;
            self.sessions.broadcast_to_conversation(
                conversation.id,
                &ServerEvent::ConversationUpdated {
                    conversation: conversation.clone(),
                },
                None,
            )?;
        }

        let assistant = Message::assistant_placeholder(
            conversation.id,
            &conversation.provider,
            &conversation.model,
            next_order + 1,
        );
        self.store.create_message(&assistant).await?;

        // Local echo first, then fan out excluding the sender
        for message in [&user_message, &assistant] {
            self.sessions.send_to(
                turn.connection_id,
                &ServerEvent::NewMessage {
                    message: message.clone(),
                },
            )?;
            self.sessions.broadcast_to_conversation(
                conversation.id,
                &ServerEvent::NewMessage {
                    message: message.clone(),
                },
                Some(turn.connection_id),
            )?;
        }

        // From here on a failure leaves the placeholder in the failed
        // terminal state instead of the completed one
        if let Err(e) = self
            .stream_turn(&turn, owner_id, &conversation, assistant.id, user_message.id)
            .await
        {
            if let Err(mark_err) = self
                .store
                .set_message_stream_state(assistant.id, false, false)
                .await
            {
                error!(
                    message_id = %assistant.id,
                    error = %mark_err,
                    "failed to mark message as failed"
                );
            }
            return Err(e);
        }

        Ok(())
    }

    /// Load or create the conversation a turn targets
    ///
    /// Resolution order: explicit id on the turn, else the conversation
    /// this session is bound to (live tag first, persisted binding as
    /// fallback), else a fresh conversation.
    async fn resolve_conversation(
        &self,
        turn: &TurnRequest,
        owner_id: Uuid,
    ) -> AppResult<Conversation> {
        if let Some(id) = turn.conversation_id {
            let conversation = self
                .store
                .get_conversation(id)
                .await?
                .filter(|c| !c.deleted)
                .ok_or_else(|| AppError::not_found(format!("conversation {id}")))?;
            if conversation.user_id != owner_id {
                return Err(AppError::new(
                    ErrorCode::PermissionDenied,
                    "conversation belongs to a different user",
                )
                .with_conversation_id(id.to_string()));
            }
            return self.apply_turn_selection(turn, owner_id, conversation).await;
        }

        let bound = match self.sessions.conversation_of(turn.connection_id) {
            Some(id) => Some(id),
            None => self.store.session_conversation(&turn.session_id).await?,
        };
        if let Some(id) = bound {
            match self.store.get_conversation(id).await? {
                Some(conversation) if !conversation.deleted && conversation.user_id == owner_id => {
                    return self.apply_turn_selection(turn, owner_id, conversation).await;
                }
                _ => {
                    debug!(
                        conversation_id = %id,
                        "session bound to an unusable conversation, starting fresh"
                    );
                }
            }
        }

        let provider = turn.provider.as_deref().unwrap_or(DEFAULT_PROVIDER);
        let model = match &turn.model {
            Some(model) => model.clone(),
            None => self.registry.default_model(provider)?.to_owned(),
        };
        self.registry.validate_model(provider, &model)?;

        let conversation = Conversation::new(owner_id, provider, model);
        self.store.create_conversation(&conversation).await?;
        info!(conversation_id = %conversation.id, provider, "conversation created");

        self.sessions.send_to(
            turn.connection_id,
            &ServerEvent::ConversationCreated {
                conversation: conversation.clone(),
            },
        )?;
        Ok(conversation)
    }

    /// Switch the conversation when the turn names a different provider/model
    async fn apply_turn_selection(
        &self,
        turn: &TurnRequest,
        owner_id: Uuid,
        conversation: Conversation,
    ) -> AppResult<Conversation> {
        if let (Some(provider), Some(model)) = (&turn.provider, &turn.model) {
            if *provider != conversation.provider || *model != conversation.model {
                return self
                    .switch_provider(turn.user_id, Some(conversation.id), owner_id, provider, model)
                    .await;
            }
        }
        Ok(conversation)
    }

    fn acquire_turn_lock(&self, conversation_id: Uuid) -> AppResult<TurnGuard> {
        match self.active_turns.entry(conversation_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AppError::new(
                ErrorCode::ResourceLocked,
                "another response is still streaming in this conversation",
            )
            .with_conversation_id(conversation_id.to_string())),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(TurnGuard {
                    active: Arc::clone(&self.active_turns),
                    conversation_id,
                })
            }
        }
    }

    /// Key resolution, provider streaming, fan-out, and settlement
    async fn stream_turn(
        &self,
        turn: &TurnRequest,
        owner_id: Uuid,
        conversation: &Conversation,
        assistant_id: Uuid,
        user_message_id: Uuid,
    ) -> AppResult<()> {
        let provider_name = conversation.provider.as_str();
        let model = conversation.model.as_str();

        let resolution = self.resolver.resolve(provider_name, turn.user_id).await?;
        if !resolution.is_user_key {
            if let Some(user_id) = turn.user_id {
                self.credits.check_preflight_floor(user_id).await?;
            }
        }

        let request = self
            .build_request(conversation, user_message_id, turn.reasoning_effort)
            .await?;

        let provider = self.registry.create(
            provider_name,
            ProviderConfig::new(resolution.api_key.clone()),
        )?;
        let ws_thinking_batch = if provider.buffers_thinking() {
            self.streaming.thinking_ws_batch_size
        } else {
            1
        };
        let mut stream = provider.stream_chat(&request).await?;

        let persist_batch = self.streaming.persist_batch_size;
        let mut text_pending = String::new();
        let mut text_pending_tokens = 0usize;
        let mut thinking_pending = String::new();
        let mut thinking_pending_tokens = 0usize;
        let mut thinking_wire = String::new();
        let mut thinking_wire_tokens = 0usize;
        let mut final_usage: Option<UsageInfo> = None;
        let mut stream_error: Option<AppError> = None;

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    stream_error = Some(e);
                    break;
                }
            };
            match event {
                StreamEvent::ThinkingStart => {
                    self.sessions.broadcast_to_conversation(
                        conversation.id,
                        &ServerEvent::ThinkingStart {
                            message_id: assistant_id,
                        },
                        None,
                    )?;
                }
                StreamEvent::ThinkingToken(token) => {
                    thinking_pending.push_str(&token);
                    thinking_pending_tokens += 1;
                    if thinking_pending_tokens >= persist_batch {
                        self.store
                            .append_message_thinking(assistant_id, &thinking_pending)
                            .await?;
                        thinking_pending.clear();
                        thinking_pending_tokens = 0;
                    }

                    thinking_wire.push_str(&token);
                    thinking_wire_tokens += 1;
                    if thinking_wire_tokens >= ws_thinking_batch {
                        self.sessions.broadcast_to_conversation(
                            conversation.id,
                            &ServerEvent::Thinking {
                                content: std::mem::take(&mut thinking_wire),
                                message_id: assistant_id,
                            },
                            None,
                        )?;
                        thinking_wire_tokens = 0;
                    }
                }
                StreamEvent::ThinkingEnd => {
                    if !thinking_wire.is_empty() {
                        self.sessions.broadcast_to_conversation(
                            conversation.id,
                            &ServerEvent::Thinking {
                                content: std::mem::take(&mut thinking_wire),
                                message_id: assistant_id,
                            },
                            None,
                        )?;
                        thinking_wire_tokens = 0;
                    }
                    self.sessions.broadcast_to_conversation(
                        conversation.id,
                        &ServerEvent::ThinkingEnd {
                            message_id: assistant_id,
                        },
                        None,
                    )?;
                }
                StreamEvent::ResponseStart => {
                    self.sessions.broadcast_to_conversation(
                        conversation.id,
                        &ServerEvent::ResponseStart {
                            message_id: assistant_id,
                        },
                        None,
                    )?;
                }
                StreamEvent::TextDelta(token) => {
                    // Live delivery is unbatched; only persistence batches
                    self.sessions.broadcast_to_conversation(
                        conversation.id,
                        &ServerEvent::Text {
                            content: token.clone(),
                            message_id: assistant_id,
                        },
                        None,
                    )?;

                    text_pending.push_str(&token);
                    text_pending_tokens += 1;
                    if text_pending_tokens >= persist_batch {
                        self.store
                            .append_message_content(assistant_id, &text_pending)
                            .await?;
                        text_pending.clear();
                        text_pending_tokens = 0;
                    }
                }
                StreamEvent::Complete { usage, .. } => {
                    final_usage = usage;
                }
            }
        }

        // Delivered partial content is kept even when the stream failed
        if !thinking_pending.is_empty() {
            self.store
                .append_message_thinking(assistant_id, &thinking_pending)
                .await?;
        }
        if !text_pending.is_empty() {
            self.store
                .append_message_content(assistant_id, &text_pending)
                .await?;
        }
        if let Some(e) = stream_error {
            return Err(e);
        }
        self.store
            .set_message_stream_state(assistant_id, false, true)
            .await?;

        let usage = if let Some(mut usage) = final_usage {
            usage.cost_cents = Some(pricing::calculate_usage(
                &self.registry,
                provider_name,
                model,
                &usage,
            ));
            self.settle(turn, owner_id, conversation, assistant_id, &usage, &resolution)
                .await;
            Some(usage)
        } else {
            None
        };

        self.sessions.broadcast_to_conversation(
            conversation.id,
            &ServerEvent::Done {
                message_id: assistant_id,
                usage,
            },
            None,
        )?;

        info!(
            conversation_id = %conversation.id,
            message_id = %assistant_id,
            provider = provider_name,
            "chat turn completed"
        );
        Ok(())
    }

    /// Persist the usage record and charge credits for system-key turns
    ///
    /// Settlement failures are logged, never surfaced: the answer has
    /// already been delivered and is not revoked.
    async fn settle(
        &self,
        turn: &TurnRequest,
        owner_id: Uuid,
        conversation: &Conversation,
        assistant_id: Uuid,
        usage: &UsageInfo,
        resolution: &KeyResolution,
    ) {
        let record = UsageRecord::new(
            assistant_id,
            conversation.id,
            owner_id,
            &conversation.provider,
            &conversation.model,
            usage,
        );
        if let Err(e) = self.store.create_usage_record(&record).await {
            error!(message_id = %assistant_id, error = %e, "failed to persist usage record");
        }

        if resolution.is_user_key {
            return;
        }
        let Some(user_id) = turn.user_id else {
            return;
        };
        if let Err(e) = self
            .credits
            .deduct_for_usage(
                user_id,
                &conversation.provider,
                &conversation.model,
                usage,
                false,
                Some(assistant_id),
                Some(conversation.id),
            )
            .await
        {
            warn!(
                %user_id,
                conversation_id = %conversation.id,
                error = %e,
                "credit deduction failed at settlement"
            );
        }
    }

    /// Assemble the upstream request from persisted history and attachments
    async fn build_request(
        &self,
        conversation: &Conversation,
        user_message_id: Uuid,
        reasoning_effort: Option<ReasoningEffort>,
    ) -> AppResult<StreamRequest> {
        let history = self.store.list_messages(conversation.id).await?;
        let attachments = self
            .store
            .attachments_for_conversation(conversation.id)
            .await?;

        let mut messages = Vec::new();
        if let Some(system_prompt) = &conversation.system_prompt {
            messages.push(ChatMessage::system(system_prompt.clone()));
        }

        for message in &history {
            // The still-streaming placeholder carries no content yet
            if message.is_streaming || message.content.is_empty() {
                continue;
            }
            if message.id == user_message_id {
                let content = self
                    .user_content_with_attachments(message, &attachments, &conversation.provider)
                    .await?;
                messages.push(ChatMessage {
                    role: MessageRole::User,
                    content,
                });
                continue;
            }
            let chat_message = match message.role {
                MessageRole::User => ChatMessage::user(message.content.clone()),
                MessageRole::Assistant => ChatMessage::assistant(message.content.clone()),
                MessageRole::System => ChatMessage::system(message.content.clone()),
            };
            messages.push(chat_message);
        }

        let model_info = self
            .registry
            .model_info(&conversation.provider, &conversation.model)
            .ok_or_else(|| {
                AppError::unsupported_model(&conversation.model, &conversation.provider)
            })?;

        let effort = if model_info.supports_reasoning_effort {
            match reasoning_effort {
                Some(effort) if model_info.reasoning_effort_levels.contains(&effort) => {
                    Some(effort)
                }
                Some(effort) => {
                    debug!(
                        ?effort,
                        model = %conversation.model,
                        "unsupported effort level, using model default"
                    );
                    model_info.default_reasoning_effort
                }
                None => model_info.default_reasoning_effort,
            }
        } else {
            None
        };

        Ok(StreamRequest::new(messages, conversation.model.clone())
            .with_thinking(model_info.supports_thinking)
            .with_reasoning_effort(effort))
    }

    /// Inline supported attachments as image parts; fold text-like ones
    /// that cannot be inlined into the prompt text instead. Oversized or
    /// unsupported binary attachments are skipped.
    async fn user_content_with_attachments(
        &self,
        message: &Message,
        attachments: &[Attachment],
        provider: &str,
    ) -> AppResult<Vec<MessageContent>> {
        let mut text = message.content.clone();
        let mut parts = Vec::new();

        for attachment in attachments
            .iter()
            .filter(|a| a.message_id == Some(message.id))
        {
            let inline_ok = attachment.size_bytes <= MAX_INLINE_ATTACHMENT_BYTES
                && self
                    .registry
                    .supports_attachment_type(provider, &attachment.mime_type);

            if inline_ok {
                match self.blobs.get(&attachment.blob_key).await? {
                    Some(bytes) => parts.push(MessageContent::Image {
                        mime_type: attachment.mime_type.clone(),
                        data: BASE64.encode(bytes),
                    }),
                    None => {
                        warn!(
                            attachment_id = %attachment.id,
                            blob_key = %attachment.blob_key,
                            "attachment blob missing, skipping"
                        );
                    }
                }
            } else if is_text_like(&attachment.mime_type) {
                if let Some(bytes) = self.blobs.get(&attachment.blob_key).await? {
                    let excerpt: String = String::from_utf8_lossy(&bytes)
                        .chars()
                        .take(TEXT_EXCERPT_MAX_CHARS)
                        .collect();
                    text.push_str(&format!(
                        "\n\n[File: {}]\n{excerpt}",
                        attachment.file_name
                    ));
                }
            } else {
                debug!(
                    attachment_id = %attachment.id,
                    mime_type = %attachment.mime_type,
                    size_bytes = attachment.size_bytes,
                    "attachment not inlinable, skipping"
                );
            }
        }

        let mut content = vec![MessageContent::Text { text }];
        content.extend(parts);
        Ok(content)
    }

    /// Validate and apply a provider/model switch for a conversation
    ///
    /// # Errors
    ///
    /// Any key-resolution failure surfaces as `ProviderNotConfigured`; the
    /// check exists to fail fast, not to reserve the key.
    pub async fn switch_provider(
        &self,
        user_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
        owner_id: Uuid,
        provider: &str,
        model: &str,
    ) -> AppResult<Conversation> {
        self.registry.validate_model(provider, model)?;
        self.resolver
            .resolve(provider, user_id)
            .await
            .map_err(|_| AppError::provider_not_configured(provider))?;

        let conversation = match conversation_id {
            Some(id) => {
                let mut conversation = self
                    .store
                    .get_conversation(id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("conversation {id}")))?;
                self.store
                    .update_conversation_provider(id, provider, model)
                    .await?;
                conversation.provider = provider.to_owned();
                conversation.model = model.to_owned();
                self.sessions.broadcast_to_conversation(
                    id,
                    &ServerEvent::ConversationUpdated {
                        conversation: conversation.clone(),
                    },
                    None,
                )?;
                conversation
            }
            None => {
                let conversation = Conversation::new(owner_id, provider, model);
                self.store.create_conversation(&conversation).await?;
                conversation
            }
        };
        Ok(conversation)
    }

    /// Retag a connection and reply with the switched conversation's state
    pub async fn switch_conversation(
        &self,
        connection_id: Uuid,
        session_id: &str,
        conversation_id: Option<Uuid>,
    ) -> AppResult<()> {
        self.sessions.set_conversation(connection_id, conversation_id);
        if let Some(id) = conversation_id {
            self.sessions.adopt_session_connections(session_id, id);
        }
        self.store.bind_session(session_id, conversation_id).await?;

        let Some(id) = conversation_id else {
            return self.sessions.send_to(
                connection_id,
                &ServerEvent::ConversationSwitched {
                    conversation: None,
                    messages: Vec::new(),
                    has_active_stream: false,
                },
            );
        };

        let conversation = self.store.get_conversation(id).await?;
        let (messages, has_active_stream) = match &conversation {
            Some(_) => {
                let messages = self.store.list_messages(id).await?;
                let streaming = self.store.streaming_messages(id).await?;
                (messages, !streaming.is_empty())
            }
            None => (Vec::new(), false),
        };

        self.sessions.send_to(
            connection_id,
            &ServerEvent::ConversationSwitched {
                conversation,
                messages,
                has_active_stream,
            },
        )
    }

    /// Replay conversation state to a connection that just attached
    pub async fn catch_up(&self, connection_id: Uuid, conversation_id: Uuid) -> AppResult<()> {
        let Some(conversation) = self.store.get_conversation(conversation_id).await? else {
            return Err(AppError::not_found(format!(
                "conversation {conversation_id}"
            )));
        };
        let messages = self.store.list_messages(conversation_id).await?;
        let streaming = self.store.streaming_messages(conversation_id).await?;

        self.sessions.send_to(
            connection_id,
            &ServerEvent::Catchup {
                conversation,
                messages,
                has_active_stream: !streaming.is_empty(),
            },
        )
    }

    /// Incremental sync of conversations and messages for a user
    pub async fn sync_data(
        &self,
        user_id: Uuid,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> AppResult<crate::store::SyncData> {
        self.store.sync_since(user_id, since).await
    }

    /// Hard delete everything a user owns
    pub async fn clear_all_data(&self, user_id: Uuid) -> AppResult<()> {
        self.store.clear_all(user_id).await
    }

    /// Advisory floor in cents for starting a billed turn
    #[must_use]
    pub const fn preflight_floor_cents(&self) -> i64 {
        self.billing.preflight_floor_cents
    }
}

/// First characters of the prompt, ellipsized past the cap
fn derive_title(prompt: &str) -> String {
    let trimmed = prompt.trim();
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

fn is_text_like(mime_type: &str) -> bool {
    mime_type.starts_with("text/")
        || matches!(mime_type, "application/json" | "application/xml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_prompt_keeps_title() {
        assert_eq!(derive_title("What is love?"), "What is love?");
    }

    #[test]
    fn long_prompt_is_ellipsized_at_char_boundary() {
        let prompt = "é".repeat(60);
        let title = derive_title(&prompt);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn text_like_mime_detection() {
        assert!(is_text_like("text/plain"));
        assert!(is_text_like("application/json"));
        assert!(!is_text_like("image/png"));
        assert!(!is_text_like("application/pdf"));
    }

    #[test]
    fn anonymous_owner_is_stable_per_session() {
        let turn = |session: &str| TurnRequest {
            connection_id: Uuid::new_v4(),
            session_id: session.to_owned(),
            user_id: None,
            prompt: "hi".into(),
            conversation_id: None,
            message_id: None,
            provider: None,
            model: None,
            reasoning_effort: None,
        };
        assert_eq!(turn("s1").owner_id(), turn("s1").owner_id());
        assert_ne!(turn("s1").owner_id(), turn("s2").owner_id());
    }
}
