// ABOUTME: Google Gemini streaming adapter with interleaved thinking support
// ABOUTME: Translates the generateContent SSE wire format into normalized stream events
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Google Gemini Adapter
//!
//! Streams completions from `streamGenerateContent?alt=sse`. Thinking-capable
//! models run with a `thinkingConfig` budget and return reasoning parts
//! flagged `thought: true`, which map to the thinking event channel.
//!
//! Gemini delivers reasoning tokens incrementally with no upstream
//! buffering, so `buffers_thinking()` is `false` and the orchestrator
//! forwards each thinking token as it arrives.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::errors::{AppError, AppResult, ErrorCode};

use super::sse::{is_retryable_request_error, is_retryable_status, sse_events, RetryConfig, SseEvent};
use super::{
    ChatProvider, EventStream, MessageContent, MessageRole, ProviderConfig, StreamEvent,
    StreamRequest, UsageInfo,
};

const PROVIDER_NAME: &str = "google";

/// Base URL for the Generative Language API
const API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Thinking token budget for `pro` models (allowed range 128-32768)
const THINKING_BUDGET_PRO: u32 = 4096;

/// Thinking token budget for flash-class models (allowed range 0-24576)
const THINKING_BUDGET_DEFAULT: u32 = 2048;

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    /// Set by the API on reasoning parts when `includeThoughts` is on
    #[serde(skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
            thought: None,
        }
    }

    fn inline(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.into(),
                data: data.into(),
            }),
            thought: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: u32,
    include_thoughts: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    google_search: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingChunk {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: Option<GeminiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    message: String,
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Google Gemini streaming chat provider
pub struct GoogleProvider {
    api_key: String,
    base_url: String,
    client: Client,
    retry: RetryConfig,
}

impl GoogleProvider {
    /// Create a provider with a resolved API key
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            api_key: config.api_key,
            base_url: config.base_url.unwrap_or_else(|| API_BASE_URL.to_owned()),
            client: Client::new(),
            retry: RetryConfig::default_config(),
        }
    }

    /// Gemini role string; system messages go via `systemInstruction` instead
    const fn convert_role(role: MessageRole) -> &'static str {
        match role {
            MessageRole::System | MessageRole::User => "user",
            MessageRole::Assistant => "model",
        }
    }

    fn convert_parts(content: &[MessageContent]) -> Vec<GeminiPart> {
        content
            .iter()
            .map(|part| match part {
                MessageContent::Text { text } => GeminiPart::text(text.clone()),
                MessageContent::Image { mime_type, data } => {
                    GeminiPart::inline(mime_type.clone(), data.clone())
                }
            })
            .collect()
    }

    fn build_request(request: &StreamRequest) -> GeminiRequest {
        let mut contents = Vec::new();
        let mut system_instruction = None;

        for message in &request.messages {
            if message.role == MessageRole::System {
                system_instruction = Some(GeminiContent {
                    role: None,
                    parts: vec![GeminiPart::text(message.text())],
                });
            } else {
                contents.push(GeminiContent {
                    role: Some(Self::convert_role(message.role).to_owned()),
                    parts: Self::convert_parts(&message.content),
                });
            }
        }

        let generation_config = request.thinking_enabled.then(|| GenerationConfig {
            thinking_config: Some(ThinkingConfig {
                thinking_budget: if request.model.contains("pro") {
                    THINKING_BUDGET_PRO
                } else {
                    THINKING_BUDGET_DEFAULT
                },
                include_thoughts: true,
            }),
        });

        let tools = request.search_enabled.then(|| {
            vec![GeminiTool {
                google_search: serde_json::json!({}),
            }]
        });

        GeminiRequest {
            contents,
            system_instruction,
            generation_config,
            tools,
        }
    }

    /// Map API error status to an appropriate error
    ///
    /// Rate-limit responses carry a retry hint in the message which is
    /// surfaced verbatim to the caller.
    fn map_api_error(status: u16, response_text: &str) -> AppError {
        let message = serde_json::from_str::<GeminiErrorResponse>(response_text)
            .ok()
            .and_then(|r| r.error)
            .map_or_else(|| response_text.to_owned(), |e| e.message);

        if status == 429 {
            AppError::new(ErrorCode::ExternalRateLimited, message)
        } else {
            AppError::provider_stream(PROVIDER_NAME, format!("API error ({status}): {message}"))
        }
    }

    /// Issue the streaming request, retrying transient failures
    ///
    /// Retries only cover the initial request; once a response body is
    /// obtained the stream runs unretried.
    async fn send_with_retry(&self, url: &str, body: &GeminiRequest) -> AppResult<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let result = self.client.post(url).json(body).send().await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    if is_retryable_status(status) && attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for_attempt(attempt);
                        warn!(status, attempt, delay_ms = delay.as_millis() as u64, "retrying Gemini request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(Self::map_api_error(status, &text));
                }
                Err(e) => {
                    if is_retryable_request_error(&e) && attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for_attempt(attempt);
                        warn!(error = %e, attempt, "retrying Gemini request after connection error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(AppError::provider_stream(
                        PROVIDER_NAME,
                        format!("HTTP request failed: {e}"),
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl ChatProvider for GoogleProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn buffers_thinking(&self) -> bool {
        false
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn stream_chat(&self, request: &StreamRequest) -> Result<EventStream, AppError> {
        // Some catalog ids are local aliases that share an upstream model
        let upstream_model = request.model.replace("-non-thinking", "");
        let url = format!(
            "{}/models/{upstream_model}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.api_key
        );

        let body = Self::build_request(request);
        debug!(thinking = request.thinking_enabled, "starting Gemini stream");

        let started = Instant::now();
        let response = self.send_with_retry(&url, &body).await?;
        let events = sse_events(response.bytes_stream(), PROVIDER_NAME);

        let stream = async_stream::stream! {
            futures_util::pin_mut!(events);

            let mut thinking_open = false;
            let mut response_started = false;
            let mut full_text = String::new();
            let mut usage: Option<UsageInfo> = None;

            while let Some(event) = events.next().await {
                let payload = match event {
                    Ok(SseEvent::Data(json)) => json,
                    Ok(SseEvent::Done) => break,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                let chunk: StreamingChunk = match serde_json::from_str(&payload) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "skipping unparseable Gemini chunk");
                        continue;
                    }
                };

                if let Some(metadata) = chunk.usage_metadata {
                    usage = Some(UsageInfo {
                        prompt_tokens: metadata.prompt_token_count.unwrap_or(0),
                        completion_tokens: metadata.candidates_token_count.unwrap_or(0),
                        total_tokens: metadata.total_token_count.unwrap_or(0),
                        cost_cents: None,
                        duration_ms: None,
                    });
                }

                let parts = chunk
                    .candidates
                    .into_iter()
                    .flatten()
                    .filter_map(|c| c.content)
                    .flat_map(|c| c.parts);

                for part in parts {
                    let Some(text) = part.text else { continue };
                    if text.is_empty() {
                        continue;
                    }

                    if part.thought == Some(true) {
                        if !thinking_open {
                            thinking_open = true;
                            yield Ok(StreamEvent::ThinkingStart);
                        }
                        yield Ok(StreamEvent::ThinkingToken(text));
                    } else {
                        if thinking_open {
                            thinking_open = false;
                            yield Ok(StreamEvent::ThinkingEnd);
                        }
                        if !response_started {
                            response_started = true;
                            yield Ok(StreamEvent::ResponseStart);
                        }
                        full_text.push_str(&text);
                        yield Ok(StreamEvent::TextDelta(text));
                    }
                }
            }

            // A stream that was all thinking still closes the phase
            if thinking_open {
                yield Ok(StreamEvent::ThinkingEnd);
            }
            if !response_started {
                yield Ok(StreamEvent::ResponseStart);
            }

            if let Some(usage) = usage.as_mut() {
                usage.duration_ms = Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
            }

            yield Ok(StreamEvent::Complete {
                text: full_text,
                usage,
            });
        };

        Ok(Box::pin(stream))
    }
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;

    #[test]
    fn thinking_budget_follows_model_class() {
        let request = StreamRequest::new(
            vec![ChatMessage::user("hi")],
            "gemini-2.5-pro-preview-06-05",
        )
        .with_thinking(true);
        let body = GoogleProvider::build_request(&request);
        let config = body.generation_config.unwrap().thinking_config.unwrap();
        assert_eq!(config.thinking_budget, THINKING_BUDGET_PRO);

        let request = StreamRequest::new(
            vec![ChatMessage::user("hi")],
            "gemini-2.5-flash-preview-05-20",
        )
        .with_thinking(true);
        let body = GoogleProvider::build_request(&request);
        let config = body.generation_config.unwrap().thinking_config.unwrap();
        assert_eq!(config.thinking_budget, THINKING_BUDGET_DEFAULT);
    }

    #[test]
    fn system_message_becomes_system_instruction() {
        let request = StreamRequest::new(
            vec![
                ChatMessage::system("be terse"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ],
            "gemini-2.5-flash-preview-05-20",
        );
        let body = GoogleProvider::build_request(&request);
        assert!(body.system_instruction.is_some());
        assert_eq!(body.contents.len(), 2);
        assert_eq!(body.contents[0].role.as_deref(), Some("user"));
        assert_eq!(body.contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn image_parts_become_inline_data() {
        let request = StreamRequest::new(
            vec![ChatMessage::user("look").with_image("image/png", "aGk=")],
            "gemini-2.5-flash-preview-05-20",
        );
        let body = GoogleProvider::build_request(&request);
        let parts = &body.contents[0].parts;
        assert_eq!(parts.len(), 2);
        assert!(parts[1].inline_data.is_some());
    }
}
