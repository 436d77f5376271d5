// ABOUTME: Shared SSE (Server-Sent Events) line-buffering parser for provider streams
// ABOUTME: Handles partial lines across TCP boundaries and multiple events per chunk
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # SSE Stream Parsing
//!
//! A shared line-buffering parser for Server-Sent Events used by the chat
//! provider adapters. Solves two correctness issues:
//!
//! 1. **Multiple events per TCP chunk**: when network buffers batch several
//!    SSE events into a single `bytes_stream()` chunk, all events are
//!    emitted (not just the first).
//!
//! 2. **Partial JSON across TCP boundaries**: when a JSON payload is split
//!    across two TCP chunks, the line buffer accumulates partial data until
//!    a complete line arrives.
//!
//! Adapters consume [`sse_events`] and translate each `data:` payload into
//! their normalized [`StreamEvent`](super::StreamEvent)s.

use std::mem;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use rand::Rng;

use crate::errors::AppError;

/// A parsed SSE event from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload with the JSON string (prefix stripped)
    Data(String),
    /// The `[DONE]` termination signal (OpenAI convention)
    Done,
}

/// Line-buffering SSE parser that handles partial lines across TCP chunk boundaries
///
/// SSE streams are newline-delimited. TCP does not guarantee alignment between
/// network chunks and SSE event boundaries. This parser buffers incomplete lines
/// and emits complete events only when a full line (terminated by `\n`) is
/// available.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    /// Accumulated bytes not yet terminated by a newline
    buffer: String,
}

impl SseLineBuffer {
    /// Create a new empty line buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from a TCP chunk, returning any complete SSE events
    ///
    /// Bytes are appended to the internal buffer. Complete lines (terminated
    /// by `\n`) are extracted, parsed as SSE events, and returned. Any
    /// trailing partial line remains buffered for the next `feed()` call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let text = String::from_utf8_lossy(bytes);
        self.buffer.push_str(&text);

        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim_end_matches('\r').to_owned();
            self.buffer = self.buffer[newline_pos + 1..].to_owned();

            if let Some(event) = Self::parse_line(&line) {
                events.push(event);
            }
        }

        events
    }

    /// Flush any remaining buffered content as a final event
    ///
    /// Called when the byte stream ends. If a partial line remains (no
    /// trailing newline), attempt to parse it as an SSE event.
    pub fn flush(&mut self) -> Option<SseEvent> {
        let remaining = mem::take(&mut self.buffer);
        Self::parse_line(&remaining)
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        let trimmed = line.trim();

        // Empty lines are SSE event separators
        if trimmed.is_empty() {
            return None;
        }

        if trimmed == "data: [DONE]" {
            return Some(SseEvent::Done);
        }

        // Non-data SSE fields (event:, id:, retry:, comments) are ignored
        if let Some(data) = trimmed.strip_prefix("data: ") {
            if !data.trim().is_empty() {
                return Some(SseEvent::Data(data.to_owned()));
            }
        }

        None
    }
}

/// Wrap a raw byte stream with SSE line buffering
///
/// Yields one item per complete SSE event. Read errors from the underlying
/// transport surface as a single `Err` item and end the stream.
pub fn sse_events<S>(
    byte_stream: S,
    provider_name: &'static str,
) -> impl Stream<Item = Result<SseEvent, AppError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    async_stream::stream! {
        let mut parser = SseLineBuffer::new();
        let mut byte_stream = Box::pin(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in parser.feed(&bytes) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(AppError::provider_stream(
                        provider_name,
                        format!("stream read error: {e}"),
                    ));
                    return;
                }
            }
        }

        if let Some(event) = parser.flush() {
            yield Ok(event);
        }
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Shared retry configuration for provider streaming requests
///
/// Retries only cover the initial HTTP request. Once bytes start flowing,
/// the stream is not retried (the client may have already consumed partial
/// output).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum delay cap for exponential backoff (milliseconds)
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Default retry config: 3 retries, 500ms initial, 5s max
    #[must_use]
    pub const fn default_config() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
        }
    }

    /// Calculate exponential backoff delay with jitter for a given attempt
    ///
    /// `delay = min(initial_ms * 2^attempt, max_ms) + jitter(0..100ms)`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms.saturating_mul(1_u64 << attempt);
        let capped_delay = base_delay.min(self.max_delay_ms);
        // Small jitter (0-99ms) to avoid thundering herd
        let jitter = rand::thread_rng().gen_range(0..100);
        Duration::from_millis(capped_delay + jitter)
    }
}

/// Check if an HTTP error status code is retryable
///
/// Transient conditions that may resolve on retry: 429 Too Many Requests,
/// 502 Bad Gateway, 503 Service Unavailable.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503)
}

/// Check if a request error is retryable (connection/timeout errors)
#[must_use]
pub fn is_retryable_request_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_emits_multiple_events_from_one_chunk() {
        let mut parser = SseLineBuffer::new();
        let events = parser.feed(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"a\":1}".to_owned()),
                SseEvent::Data("{\"b\":2}".to_owned()),
            ]
        );
    }

    #[test]
    fn feed_buffers_partial_line_across_chunks() {
        let mut parser = SseLineBuffer::new();
        assert!(parser.feed(b"data: {\"text\":\"hel").is_empty());
        let events = parser.feed(b"lo\"}\n");
        assert_eq!(events, vec![SseEvent::Data("{\"text\":\"hello\"}".to_owned())]);
    }

    #[test]
    fn feed_detects_done_signal() {
        let mut parser = SseLineBuffer::new();
        let events = parser.feed(b"data: [DONE]\n");
        assert_eq!(events, vec![SseEvent::Done]);
    }

    #[test]
    fn feed_ignores_non_data_fields() {
        let mut parser = SseLineBuffer::new();
        let events = parser.feed(b"event: message\nid: 42\nretry: 100\n: comment\n");
        assert!(events.is_empty());
    }

    #[test]
    fn feed_strips_carriage_returns() {
        let mut parser = SseLineBuffer::new();
        let events = parser.feed(b"data: {\"a\":1}\r\n");
        assert_eq!(events, vec![SseEvent::Data("{\"a\":1}".to_owned())]);
    }

    #[test]
    fn flush_parses_trailing_partial_line() {
        let mut parser = SseLineBuffer::new();
        assert!(parser.feed(b"data: {\"tail\":true}").is_empty());
        assert_eq!(
            parser.flush(),
            Some(SseEvent::Data("{\"tail\":true}".to_owned()))
        );
        assert_eq!(parser.flush(), None);
    }

    #[test]
    fn retryable_status_codes() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(500));
    }

    #[test]
    fn backoff_delay_is_capped() {
        let config = RetryConfig::default_config();
        let delay = config.delay_for_attempt(10);
        assert!(delay <= Duration::from_millis(config.max_delay_ms + 100));
    }
}
