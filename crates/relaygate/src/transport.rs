//! Streaming transport: turns an inbound chat call into a governed provider
//! call and re-encodes its chunks as SSE wire events.
//!
//! Order of checks: validate, resolve (including the streaming capability),
//! admit, pre-flight health probe, open the stream. Every failure up to that
//! point is a [`GatewayError`]; after it, failures are reported in-band as one
//! terminal event.

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use relaygate_protocol::{
    ChatRequestBody, HEADER_EXTERNAL_API_KEY, HEADER_TENANT_ID, HEADER_USER_ID, WireEvent,
};
use secrecy::SecretString;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::StreamingSettings;
use crate::error::GatewayError;
use crate::llm::{CallerContext, ChatChunk, ChatRequest};
use crate::production::{ChatHandle, SHUTDOWN_MESSAGE};
use crate::server::AppState;

// ============================================================================
// Request building
// ============================================================================

/// Validate an inbound body and build the provider request.
///
/// HTTP headers take precedence over the body's `headers` map. Temperature
/// defaults only when absent; streaming is always on.
pub fn build_request(
    body: ChatRequestBody,
    headers: &HeaderMap,
    streaming: &StreamingSettings,
) -> Result<ChatRequest, GatewayError> {
    let provider = body.provider.trim().to_string();
    let model = body.model.trim().to_string();
    if provider.is_empty() {
        return Err(GatewayError::validation("provider is required"));
    }
    if model.is_empty() {
        return Err(GatewayError::validation("model is required"));
    }
    if let Some(t) = body.temperature
        && !t.is_finite()
    {
        return Err(GatewayError::validation("temperature must be a finite number"));
    }

    let pass_through = |name: &str| -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                body.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.as_str())
            })
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let caller = CallerContext {
        api_key: pass_through(HEADER_EXTERNAL_API_KEY).map(SecretString::from),
        tenant_id: pass_through(HEADER_TENANT_ID),
        user_id: pass_through(HEADER_USER_ID),
    };

    Ok(ChatRequest {
        provider,
        model,
        messages: body.messages,
        temperature: body.temperature.unwrap_or(streaming.default_temperature),
        stream: true,
        meta: body.meta,
        caller,
    })
}

// ============================================================================
// Pipeline
// ============================================================================

/// Run a validated request through resolve, admission and pre-flight, and
/// open the provider stream.
pub async fn open_stream(
    state: &AppState,
    request: ChatRequest,
) -> Result<ChatEventStream, GatewayError> {
    let provider = state
        .registry
        .resolve(&request.provider)
        .ok_or_else(|| GatewayError::NotFound(request.provider.clone()))?;
    if let Some(descriptor) = state.registry.descriptor(&request.provider)
        && !descriptor.capabilities.streaming
    {
        return Err(GatewayError::validation(format!(
            "provider '{}' does not support streaming",
            request.provider
        )));
    }

    let mut admission = state.middleware.admit(&request.provider)?;

    let health = tokio::select! {
        biased;
        _ = admission.cancelled() => {
            return Err(GatewayError::unavailable("gateway is shutting down"));
        }
        health = provider.available() => health,
    };
    if let Err(e) = health {
        admission.fail(&e.to_string());
        return Err(GatewayError::unavailable(format!(
            "provider '{}' is unavailable: {}",
            request.provider, e
        )));
    }

    let stream_id = Ulid::new();
    let provider_name = request.provider.clone();
    let model = request.model.clone();
    let handle = state.middleware.chat(admission, provider, request).await?;

    debug!(stream_id = %stream_id, provider = %provider_name, model = %model, "Stream opened");
    Ok(ChatEventStream::new(handle, stream_id, provider_name, model))
}

/// Wrap an event stream in an SSE response.
pub fn sse_response(stream: ChatEventStream, keep_alive_interval: Duration) -> Response {
    let keep_alive = KeepAlive::new()
        .interval(keep_alive_interval)
        .text("keep-alive");
    Sse::new(stream).keep_alive(keep_alive).into_response()
}

/// Build, open and serve a chat call. Errors before the stream opens become
/// JSON error responses.
pub async fn serve(state: &AppState, request: ChatRequest) -> Response {
    match open_stream(state, request).await {
        Ok(stream) => sse_response(stream, state.keep_alive_interval),
        Err(e) => {
            debug!(error = %e, kind = e.kind(), "Chat request rejected");
            e.into_response()
        }
    }
}

// ============================================================================
// ChatEventStream
// ============================================================================

/// Lifecycle of one chat stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamPhase::Completed | StreamPhase::Failed | StreamPhase::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamPhase::Pending => "pending",
            StreamPhase::Streaming => "streaming",
            StreamPhase::Completed => "completed",
            StreamPhase::Failed => "failed",
            StreamPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SSE event stream for one chat call.
///
/// Emits one event per chunk as it arrives and nothing after the terminal
/// event. Dropping it before a terminal event cancels the provider call.
pub struct ChatEventStream {
    handle: ChatHandle,
    phase: StreamPhase,
    stream_id: Ulid,
    provider: String,
    model: String,
    started: Instant,
    events: usize,
}

impl ChatEventStream {
    fn new(handle: ChatHandle, stream_id: Ulid, provider: String, model: String) -> Self {
        Self {
            handle,
            phase: StreamPhase::Pending,
            stream_id,
            provider,
            model,
            started: Instant::now(),
            events: 0,
        }
    }

    fn transition(&mut self, next: StreamPhase) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = next;
        if next.is_terminal() {
            info!(
                stream_id = %self.stream_id,
                provider = %self.provider,
                model = %self.model,
                state = %next,
                events = self.events,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "Stream finished"
            );
        }
    }

    fn encode(&mut self, event: WireEvent) -> Event {
        self.events += 1;
        match Event::default().json_data(&event) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "Failed to encode stream event");
                self.transition(StreamPhase::Failed);
                let fallback = WireEvent::failed(GatewayError::Transport(e.to_string()).to_string());
                Event::default().data(
                    serde_json::to_string(&fallback)
                        .unwrap_or_else(|_| r#"{"error":"transport error","done":true}"#.to_string()),
                )
            }
        }
    }
}

impl Stream for ChatEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.phase.is_terminal() {
                return Poll::Ready(None);
            }

            let chunk = match Pin::new(&mut self.handle).poll_next(cx) {
                Poll::Ready(chunk) => chunk,
                Poll::Pending => return Poll::Pending,
            };

            let (event, next) = match chunk {
                Some(ChatChunk::Delta(content)) => {
                    self.transition(StreamPhase::Streaming);
                    if content.is_empty() {
                        continue;
                    }
                    (WireEvent::delta(content), StreamPhase::Streaming)
                }
                Some(ChatChunk::Done(usage)) => (WireEvent::completed(usage), StreamPhase::Completed),
                Some(ChatChunk::Error(message)) if self.handle.closed_by_shutdown() => {
                    (WireEvent::failed(message), StreamPhase::Cancelled)
                }
                Some(ChatChunk::Error(message)) => (WireEvent::failed(message), StreamPhase::Failed),
                // Forwarder stopped without a terminal chunk: only cancellation does that
                None => (WireEvent::failed(SHUTDOWN_MESSAGE), StreamPhase::Cancelled),
            };

            let encoded = self.encode(event);
            self.transition(next);
            return Poll::Ready(Some(Ok(encoded)));
        }
    }
}

impl Drop for ChatEventStream {
    fn drop(&mut self) {
        // Caller went away before the end; the handle's drop cancels the provider call
        self.transition(StreamPhase::Cancelled);
    }
}
