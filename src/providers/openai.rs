// ABOUTME: OpenAI streaming adapter covering both reasoning and standard chat models
// ABOUTME: Prefers the responses endpoint for reasoning models, with a chat-completions fallback
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # OpenAI Adapter
//!
//! Reasoning-effort-capable models stream from `/v1/responses`, which
//! exposes reasoning summaries as a separate delta channel. If that request
//! fails before any event was emitted, the adapter falls back to
//! `/v1/chat/completions`. The fallback never happens once streaming has
//! started, so clients cannot observe duplicated or partial content.
//!
//! OpenAI buffers reasoning summaries upstream and flushes them in large
//! pieces, so `buffers_thinking()` is `true`.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::errors::{AppError, AppResult, ErrorCode};

use super::sse::{is_retryable_request_error, is_retryable_status, sse_events, RetryConfig, SseEvent};
use super::{
    ChatProvider, EventStream, MessageContent, ProviderConfig, StreamEvent, StreamRequest,
    UsageInfo,
};

const PROVIDER_NAME: &str = "openai";

const API_BASE_URL: &str = "https://api.openai.com/v1";

// ============================================================================
// Chat Completions Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Option<Vec<CompletionChoice>>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    delta: Option<CompletionDelta>,
}

#[derive(Debug, Deserialize)]
struct CompletionDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

// ============================================================================
// Responses Endpoint Wire Types
// ============================================================================

/// One tagged event from the responses streaming endpoint
#[derive(Debug, Deserialize)]
struct ResponsesEvent {
    #[serde(rename = "type")]
    kind: String,
    delta: Option<String>,
    response: Option<ResponsesBody>,
}

#[derive(Debug, Deserialize)]
struct ResponsesBody {
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: Option<OpenAiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CompletionContentPart {
    Text {
        #[serde(rename = "type")]
        kind: &'static str,
        text: String,
    },
    Image {
        #[serde(rename = "type")]
        kind: &'static str,
        image_url: ImageUrl,
    },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// OpenAI streaming chat provider
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    client: Client,
    retry: RetryConfig,
}

impl OpenAiProvider {
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

    fn chat_completion_messages(request: &StreamRequest) -> Vec<serde_json::Value> {
        request
            .messages
            .iter()
            .map(|message| {
                let has_images = message
                    .content
                    .iter()
                    .any(|part| matches!(part, MessageContent::Image { .. }));
                if has_images {
                    let parts: Vec<CompletionContentPart> = message
                        .content
                        .iter()
                        .map(|part| match part {
                            MessageContent::Text { text } => CompletionContentPart::Text {
                                kind: "text",
                                text: text.clone(),
                            },
                            MessageContent::Image { mime_type, data } => {
                                CompletionContentPart::Image {
                                    kind: "image_url",
                                    image_url: ImageUrl {
                                        url: format!("data:{mime_type};base64,{data}"),
                                    },
                                }
                            }
                        })
                        .collect();
                    json!({ "role": message.role.as_str(), "content": parts })
                } else {
                    json!({ "role": message.role.as_str(), "content": message.text() })
                }
            })
            .collect()
    }

    fn responses_input(request: &StreamRequest) -> Vec<serde_json::Value> {
        request
            .messages
            .iter()
            .map(|message| {
                let text_kind = match message.role {
                    super::MessageRole::Assistant => "output_text",
                    _ => "input_text",
                };
                let parts: Vec<serde_json::Value> = message
                    .content
                    .iter()
                    .map(|part| match part {
                        MessageContent::Text { text } => {
                            json!({ "type": text_kind, "text": text })
                        }
                        MessageContent::Image { mime_type, data } => json!({
                            "type": "input_image",
                            "image_url": format!("data:{mime_type};base64,{data}"),
                        }),
                    })
                    .collect();
                json!({ "role": message.role.as_str(), "content": parts })
            })
            .collect()
    }

    fn map_api_error(status: u16, response_text: &str) -> AppError {
        let message = serde_json::from_str::<OpenAiErrorResponse>(response_text)
            .ok()
            .and_then(|r| r.error)
            .map_or_else(|| response_text.to_owned(), |e| e.message);

        if status == 429 {
            AppError::new(ErrorCode::ExternalRateLimited, message)
        } else {
            AppError::provider_stream(PROVIDER_NAME, format!("API error ({status}): {message}"))
        }
    }

    /// Issue a streaming request, retrying transient failures of the
    /// initial call only
    async fn send_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> AppResult<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    if is_retryable_status(status) && attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for_attempt(attempt);
                        warn!(status, attempt, "retrying OpenAI request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(Self::map_api_error(status, &text));
                }
                Err(e) => {
                    if is_retryable_request_error(&e) && attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for_attempt(attempt);
                        warn!(error = %e, attempt, "retrying OpenAI request after connection error");
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

    /// Stream from `/v1/responses` with a reasoning-effort hint
    async fn stream_responses(&self, request: &StreamRequest) -> AppResult<EventStream> {
        let url = format!("{}/responses", self.base_url);
        let effort = request
            .reasoning_effort
            .map_or("medium", |e| e.as_str());
        let body = json!({
            "model": request.model,
            "input": Self::responses_input(request),
            "stream": true,
            "reasoning": { "effort": effort, "summary": "auto" },
        });

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

                let event: ResponsesEvent = match serde_json::from_str(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "skipping unparseable responses event");
                        continue;
                    }
                };

                match event.kind.as_str() {
                    "response.reasoning_summary_text.delta" => {
                        let Some(delta) = event.delta else { continue };
                        if delta.is_empty() {
                            continue;
                        }
                        if !thinking_open {
                            thinking_open = true;
                            yield Ok(StreamEvent::ThinkingStart);
                        }
                        yield Ok(StreamEvent::ThinkingToken(delta));
                    }
                    "response.output_text.delta" => {
                        let Some(delta) = event.delta else { continue };
                        if delta.is_empty() {
                            continue;
                        }
                        if thinking_open {
                            thinking_open = false;
                            yield Ok(StreamEvent::ThinkingEnd);
                        }
                        if !response_started {
                            response_started = true;
                            yield Ok(StreamEvent::ResponseStart);
                        }
                        full_text.push_str(&delta);
                        yield Ok(StreamEvent::TextDelta(delta));
                    }
                    "response.completed" => {
                        if let Some(u) = event.response.and_then(|r| r.usage) {
                            usage = Some(UsageInfo {
                                prompt_tokens: u.input_tokens.unwrap_or(0),
                                completion_tokens: u.output_tokens.unwrap_or(0),
                                total_tokens: u.total_tokens.unwrap_or(0),
                                cost_cents: None,
                                duration_ms: None,
                            });
                        }
                    }
                    "response.failed" | "error" => {
                        yield Err(AppError::provider_stream(
                            PROVIDER_NAME,
                            format!("responses stream failed: {payload}"),
                        ));
                        return;
                    }
                    _ => {}
                }
            }

            if thinking_open {
                yield Ok(StreamEvent::ThinkingEnd);
            }
            if !response_started {
                yield Ok(StreamEvent::ResponseStart);
            }

            if let Some(usage) = usage.as_mut() {
                usage.duration_ms = Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
            }

            yield Ok(StreamEvent::Complete { text: full_text, usage });
        };

        Ok(Box::pin(stream))
    }

    /// Stream from `/v1/chat/completions` with usage reporting enabled
    async fn stream_completions(&self, request: &StreamRequest) -> AppResult<EventStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": request.model,
            "messages": Self::chat_completion_messages(request),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        let started = Instant::now();
        let response = self.send_with_retry(&url, &body).await?;
        let events = sse_events(response.bytes_stream(), PROVIDER_NAME);

        let stream = async_stream::stream! {
            futures_util::pin_mut!(events);

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

                let chunk: CompletionChunk = match serde_json::from_str(&payload) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "skipping unparseable completion chunk");
                        continue;
                    }
                };

                if let Some(u) = chunk.usage {
                    usage = Some(UsageInfo {
                        prompt_tokens: u.prompt_tokens.unwrap_or(0),
                        completion_tokens: u.completion_tokens.unwrap_or(0),
                        total_tokens: u.total_tokens.unwrap_or(0),
                        cost_cents: None,
                        duration_ms: None,
                    });
                }

                let delta = chunk
                    .choices
                    .into_iter()
                    .flatten()
                    .next()
                    .and_then(|c| c.delta)
                    .and_then(|d| d.content);
                if let Some(delta) = delta {
                    if delta.is_empty() {
                        continue;
                    }
                    if !response_started {
                        response_started = true;
                        yield Ok(StreamEvent::ResponseStart);
                    }
                    full_text.push_str(&delta);
                    yield Ok(StreamEvent::TextDelta(delta));
                }
            }

            if !response_started {
                yield Ok(StreamEvent::ResponseStart);
            }

            if let Some(usage) = usage.as_mut() {
                usage.duration_ms = Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
            }

            yield Ok(StreamEvent::Complete { text: full_text, usage });
        };

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn buffers_thinking(&self) -> bool {
        true
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn stream_chat(&self, request: &StreamRequest) -> Result<EventStream, AppError> {
        if request.reasoning_effort.is_some() {
            debug!("starting OpenAI responses stream");
            match self.stream_responses(request).await {
                Ok(stream) => return Ok(stream),
                // Fallback is safe here: the responses request failed before
                // a single event reached the caller
                Err(e) => {
                    warn!(error = %e, "responses endpoint failed, falling back to chat completions");
                }
            }
        }

        debug!("starting OpenAI chat completions stream");
        self.stream_completions(request).await
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
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
    fn plain_messages_serialize_as_strings() {
        let request = StreamRequest::new(
            vec![ChatMessage::system("be terse"), ChatMessage::user("hi")],
            "gpt-4o",
        );
        let messages = OpenAiProvider::chat_completion_messages(&request);
        assert_eq!(messages[0]["content"], "be terse");
        assert_eq!(messages[1]["role"], "user");
        assert!(messages[1]["content"].is_string());
    }

    #[test]
    fn image_messages_serialize_as_part_arrays() {
        let request = StreamRequest::new(
            vec![ChatMessage::user("look").with_image("image/png", "aGk=")],
            "gpt-4o",
        );
        let messages = OpenAiProvider::chat_completion_messages(&request);
        let parts = messages[0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,aGk=");
    }

    #[test]
    fn responses_input_tags_assistant_output() {
        let request = StreamRequest::new(
            vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            "o3-2025-04-16",
        );
        let input = OpenAiProvider::responses_input(&request);
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["content"][0]["type"], "output_text");
    }
}
