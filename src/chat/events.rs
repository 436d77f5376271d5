// ABOUTME: WebSocket wire messages exchanged with chat clients
// ABOUTME: Tagged server events and inbound client commands
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire contract for the chat WebSocket. Every frame is a JSON object with
//! a `type` tag; payload fields use camelCase for client compatibility.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::providers::{ReasoningEffort, UsageInfo};
use crate::store::{Conversation, Message};

/// Outbound event pushed to clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Initial state replay after connect
    Catchup {
        conversation: Conversation,
        messages: Vec<Message>,
        #[serde(rename = "hasActiveStream")]
        has_active_stream: bool,
    },
    /// Acknowledges a conversation switch, with replayed state
    ConversationSwitched {
        conversation: Option<Conversation>,
        messages: Vec<Message>,
        #[serde(rename = "hasActiveStream")]
        has_active_stream: bool,
    },
    /// Sent to the initiating connection when a turn creates a conversation
    ConversationCreated { conversation: Conversation },
    /// Conversation metadata changed (title, provider, model)
    ConversationUpdated { conversation: Conversation },
    /// A message row was created
    NewMessage { message: Message },
    ThinkingStart {
        #[serde(rename = "messageId")]
        message_id: Uuid,
    },
    Thinking {
        content: String,
        #[serde(rename = "messageId")]
        message_id: Uuid,
    },
    ThinkingEnd {
        #[serde(rename = "messageId")]
        message_id: Uuid,
    },
    ResponseStart {
        #[serde(rename = "messageId")]
        message_id: Uuid,
    },
    /// Answer token delta, forwarded unbatched
    Text {
        content: String,
        #[serde(rename = "messageId")]
        message_id: Uuid,
    },
    /// Turn finished successfully
    Done {
        #[serde(rename = "messageId")]
        message_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<UsageInfo>,
    },
    /// Turn or request failure, delivered to the sender only
    Error { message: String },
    Pong,
}

/// Inbound command from a client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a chat turn, creating the conversation if needed
    StartChat {
        prompt: String,
        #[serde(default, rename = "conversationId")]
        conversation_id: Option<Uuid>,
        /// Client-supplied id for the user message row
        #[serde(default, rename = "messageId")]
        message_id: Option<Uuid>,
        #[serde(default)]
        provider: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default, rename = "reasoningEffort")]
        reasoning_effort: Option<ReasoningEffort>,
    },
    /// Point this connection at a different conversation (or none)
    SwitchConversation {
        #[serde(rename = "conversationId")]
        conversation_id: Option<Uuid>,
    },
    Ping,
}
