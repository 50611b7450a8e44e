//! Decoding of upstream SSE events into [`ChatChunk`]s.
//!
//! Each backend supplies a [`ChunkDecoder`] for its own event format.
//! [`DecodedStream`] drives it and guarantees the stream contract: at most one
//! terminal chunk, nothing after it, and a terminal chunk even when upstream
//! just stops.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use super::error::LLMError;
use super::types::{ChatChunk, UsageMeter};
use crate::sse_parser::{SseEvent, SseEventStream};

/// Backend-specific translation of SSE events.
pub trait ChunkDecoder: Send + Unpin {
    /// Decode one upstream event, pushing zero or more chunks.
    fn decode(&mut self, event: SseEvent, out: &mut VecDeque<ChatChunk>);

    /// Terminal chunk for an upstream stream that ended without one.
    fn finish(&mut self) -> ChatChunk;
}

/// Running totals shared by the decoders.
#[derive(Debug)]
pub struct Accumulator {
    meter: UsageMeter,
    completion_chars: usize,
    reported_tokens: Option<u64>,
}

impl Accumulator {
    pub fn new(meter: UsageMeter) -> Self {
        Self {
            meter,
            completion_chars: 0,
            reported_tokens: None,
        }
    }

    pub fn delta(&mut self, content: String) -> ChatChunk {
        self.completion_chars += content.chars().count();
        ChatChunk::Delta(content)
    }

    /// Record an upstream token count, replacing any earlier one.
    pub fn report_tokens(&mut self, tokens: u64) {
        self.reported_tokens = Some(tokens);
    }

    /// Add to the upstream token count (for APIs that report input and output separately).
    pub fn add_tokens(&mut self, tokens: u64) {
        *self.reported_tokens.get_or_insert(0) += tokens;
    }

    pub fn done(&self) -> ChatChunk {
        ChatChunk::Done(self.meter.finish(self.reported_tokens, self.completion_chars))
    }
}

/// Stream of chunks decoded from an upstream SSE byte stream.
pub struct DecodedStream<S, D> {
    inner: SseEventStream<S>,
    decoder: D,
    pending: VecDeque<ChatChunk>,
    finished: bool,
}

impl<S, D> DecodedStream<S, D> {
    pub fn new(inner: S, decoder: D) -> Self {
        Self {
            inner: SseEventStream::new(inner),
            decoder,
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl<S, E, D> Stream for DecodedStream<S, D>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<LLMError>,
    D: ChunkDecoder,
{
    type Item = ChatChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                if chunk.is_terminal() {
                    self.finished = true;
                    self.pending.clear();
                }
                return Poll::Ready(Some(chunk));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            let this = &mut *self;
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => this.decoder.decode(event, &mut this.pending),
                Poll::Ready(Some(Err(e))) => this.pending.push_back(ChatChunk::Error(e.to_string())),
                Poll::Ready(None) => {
                    let last = this.decoder.finish();
                    this.pending.push_back(last);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
