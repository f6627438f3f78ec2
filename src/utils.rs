//! Streaming utilities: SSE parsing and write coalescing.
//!
//! The completion endpoint streams Server-Sent Events in the OpenAI chunk
//! format:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}
//!
//! data: [DONE]
//! ```
//!
//! [`parse_sse_stream`] turns the raw response into a stream of text
//! fragments. Event framing (events split across TCP reads, several events in
//! one read) is handled by `eventsource-stream`.
//!
//! While a reply streams, each fragment must also reach the server-side copy of
//! the chat. Writing the whole chat once per fragment would turn a long answer
//! into hundreds of updates, so [`DeltaCoalescer`] batches fragments and
//! signals when a write is due.

use crate::types::CompletionChunk;
use crate::{Error, Result};
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::{Duration, Instant};

/// Boxed stream of text fragments.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Parses a streaming completion response into text fragments.
///
/// Events without text content (role announcements, empty keep-alives, the
/// `[DONE]` sentinel) are skipped. A chunk that is not valid JSON yields an
/// [`Error::Stream`] item; the stream itself keeps going.
pub fn parse_sse_stream(response: reqwest::Response) -> TextStream {
    let stream = response
        .bytes_stream()
        .eventsource()
        .filter_map(|event| async move {
            let event = match event {
                Ok(event) => event,
                Err(e) => return Some(Err(Error::stream(e.to_string()))),
            };

            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                return None;
            }

            match parse_chunk_text(data) {
                Ok(Some(text)) => Some(Ok(text)),
                Ok(None) => None,
                Err(e) => {
                    log::warn!("Failed to parse stream chunk {}: {}", data, e);
                    Some(Err(e))
                }
            }
        });

    Box::pin(stream)
}

/// Text carried by one `data:` payload, if any.
pub(crate) fn parse_chunk_text(data: &str) -> Result<Option<String>> {
    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| Error::stream(format!("Failed to parse chunk: {}", e)))?;

    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect();

    Ok(if text.is_empty() { None } else { Some(text) })
}

/// Batches streamed fragments into periodic writes.
///
/// A flush is due once `flush_every` fragments are pending or `interval` has
/// passed since the last flush, whichever comes first.
#[derive(Debug)]
pub struct DeltaCoalescer {
    pending: String,
    fragments: usize,
    flush_every: usize,
    interval: Duration,
    last_flush: Instant,
}

impl DeltaCoalescer {
    pub fn new(flush_every: usize, interval: Duration) -> Self {
        Self {
            pending: String::new(),
            fragments: 0,
            flush_every: flush_every.max(1),
            interval,
            last_flush: Instant::now(),
        }
    }

    /// Buffers `fragment` and reports whether a flush is due.
    pub fn push(&mut self, fragment: &str) -> bool {
        self.pending.push_str(fragment);
        self.fragments += 1;
        self.fragments >= self.flush_every || self.last_flush.elapsed() >= self.interval
    }

    /// Drains the buffered text and restarts the flush window.
    pub fn take(&mut self) -> String {
        self.fragments = 0;
        self.last_flush = Instant::now();
        std::mem::take(&mut self.pending)
    }

    /// Returns text from a failed flush to the front of the buffer.
    pub fn put_back(&mut self, text: &str) {
        self.pending.insert_str(0, text);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
