//! Server-Sent Events parser for upstream provider responses.
//!
//! Turns a raw byte stream into discrete [`SseEvent`]s. Lines are split on
//! `\n` (a trailing `\r` is stripped), multi-line `data:` fields are joined with
//! `\n`, comments are skipped, and a blank line dispatches the pending event.
//! Bytes are buffered until a full line is available so multi-byte characters
//! split across network chunks decode correctly.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::llm::LLMError;

/// A single dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    pub data: String,
}

/// Stream adapter from bytes to [`SseEvent`]s.
pub struct SseEventStream<S> {
    inner: S,
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    done: bool,
}

impl<S> SseEventStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
            done: false,
        }
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }
}

impl<S, E> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<LLMError>,
{
    type Item = Result<SseEvent, LLMError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\n', '\r']);

                if line.is_empty() {
                    if let Some(event) = self.take_event() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                } else {
                    let line = line.to_string();
                    self.process_line(&line);
                }
                continue;
            }

            if self.done {
                if !self.buffer.is_empty() {
                    // Unterminated final line
                    self.buffer.push(b'\n');
                    continue;
                }
                return Poll::Ready(self.take_event().map(Ok));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => self.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    self.buffer.clear();
                    self.data.clear();
                    self.event = None;
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Ready(None) => self.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
