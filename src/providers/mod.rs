// ABOUTME: Provider abstraction for streaming chat completions
// ABOUTME: Normalized request/event types plus the ChatProvider trait
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Chat Provider Abstraction
//!
//! Unified interface over upstream LLM APIs. Each adapter translates its
//! provider's wire format into a single stream of [`StreamEvent`]s so the
//! orchestrator never branches on provider identity.
//!
//! ## Event ordering
//!
//! A well-formed stream emits, in order:
//!
//! 1. Zero or one thinking phase: `ThinkingStart`, one or more
//!    `ThinkingToken`s, `ThinkingEnd`
//! 2. `ResponseStart`
//! 3. Zero or more `TextDelta`s
//! 4. Exactly one `Complete` carrying the full text and usage, if the
//!    upstream reported any
//!
//! Adapters enforce this ordering themselves; consumers may rely on it.
//!
//! ## Modules
//!
//! - [`registry`] - Model catalog and provider construction
//! - [`resolver`] - User-key vs. system-key resolution
//! - [`google`] - Gemini adapter (SSE, interleaved thinking)
//! - [`openai`] - OpenAI adapter (responses endpoint with fallback)
//! - [`sse`] - Shared server-sent-events line parsing

pub mod google;
pub mod openai;
pub mod registry;
pub mod resolver;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

pub use registry::{ModelInfo, ProviderInfo, ProviderRegistry};
pub use resolver::{KeyResolution, KeyResolver};

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    /// Wire string used by most provider APIs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One part of a message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text
    Text { text: String },
    /// Inline binary attachment, base64-encoded
    Image { mime_type: String, data: String },
}

/// A single message in the conversation history sent upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: Vec<MessageContent>,
}

impl ChatMessage {
    /// Create a plain-text user message
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![MessageContent::Text { text: text.into() }],
        }
    }

    /// Create a plain-text assistant message
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: vec![MessageContent::Text { text: text.into() }],
        }
    }

    /// Create a plain-text system message
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: vec![MessageContent::Text { text: text.into() }],
        }
    }

    /// Append an inline image part to this message
    #[must_use]
    pub fn with_image(mut self, mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        self.content.push(MessageContent::Image {
            mime_type: mime_type.into(),
            data: data.into(),
        });
        self
    }

    /// Concatenated text parts of this message; image parts are skipped
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let MessageContent::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// Reasoning effort hint for models that accept one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    /// Wire string sent to the upstream API
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::str::FromStr for ReasoningEffort {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(Self::Minimal),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(AppError::invalid_input(format!(
                "unknown reasoning effort: {other}"
            ))),
        }
    }
}

/// Token counts and cost reported at the end of a completed stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Billed cost in cents, filled in by the metering layer, not adapters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_cents: Option<u32>,
    /// Wall-clock duration of the turn in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Normalized request passed to every adapter
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Full conversation history, oldest first
    pub messages: Vec<ChatMessage>,
    /// Provider-specific model identifier
    pub model: String,
    /// Enable the thinking phase for models that support it
    pub thinking_enabled: bool,
    /// Enable provider-side web search grounding
    pub search_enabled: bool,
    /// Effort hint for reasoning models; ignored by others
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl StreamRequest {
    /// Create a request with default feature flags
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            thinking_enabled: false,
            search_enabled: false,
            reasoning_effort: None,
        }
    }

    #[must_use]
    pub const fn with_thinking(mut self, enabled: bool) -> Self {
        self.thinking_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_search(mut self, enabled: bool) -> Self {
        self.search_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_reasoning_effort(mut self, effort: Option<ReasoningEffort>) -> Self {
        self.reasoning_effort = effort;
        self
    }
}

/// Per-instance adapter configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Resolved API key (user-supplied or system)
    pub api_key: String,
    /// Base URL override, primarily for tests
    pub base_url: Option<String>,
}

impl ProviderConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// One normalized event in an adapter's output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The model started a thinking phase
    ThinkingStart,
    /// A fragment of thinking text
    ThinkingToken(String),
    /// The thinking phase ended
    ThinkingEnd,
    /// The visible response is about to begin
    ResponseStart,
    /// A fragment of visible response text
    TextDelta(String),
    /// Terminal event: the full assembled text and usage, if reported
    Complete {
        text: String,
        usage: Option<UsageInfo>,
    },
}

/// Boxed stream of normalized events produced by an adapter
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, AppError>> + Send>>;

/// Streaming chat completion backend
///
/// Implementations own their HTTP client and credentials. `stream_chat`
/// returns quickly with a lazy stream; upstream errors surface as `Err`
/// items inside the stream rather than failing the call.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stable provider identifier, e.g. `"google"`
    fn name(&self) -> &'static str;

    /// Whether this provider delivers thinking output in large buffered
    /// chunks rather than token by token
    ///
    /// Buffering providers get their thinking tokens re-batched before
    /// broadcast; providers that already stream incrementally are
    /// forwarded one token at a time.
    fn buffers_thinking(&self) -> bool;

    /// Open a streaming completion for `request`
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized or the
    /// upstream connection cannot be established.
    async fn stream_chat(&self, request: &StreamRequest) -> Result<EventStream, AppError>;
}

impl std::fmt::Debug for dyn ChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatProvider")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text_skips_image_parts() {
        let msg = ChatMessage::user("describe this").with_image("image/png", "aGVsbG8=");
        assert_eq!(msg.text(), "describe this");
        assert_eq!(msg.content.len(), 2);
    }

    #[test]
    fn reasoning_effort_round_trips_through_str() {
        for effort in [
            ReasoningEffort::Minimal,
            ReasoningEffort::Low,
            ReasoningEffort::Medium,
            ReasoningEffort::High,
        ] {
            let parsed: ReasoningEffort = effort.as_str().parse().unwrap();
            assert_eq!(parsed, effort);
        }
        assert!("extreme".parse::<ReasoningEffort>().is_err());
    }

    #[test]
    fn stream_request_builders_set_flags() {
        let req = StreamRequest::new(vec![ChatMessage::user("hi")], "gemini-2.5-flash")
            .with_thinking(true)
            .with_search(true)
            .with_reasoning_effort(Some(ReasoningEffort::High));
        assert!(req.thinking_enabled);
        assert!(req.search_enabled);
        assert_eq!(req.reasoning_effort, Some(ReasoningEffort::High));
    }
}
