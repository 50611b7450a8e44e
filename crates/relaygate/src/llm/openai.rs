//! OpenAI-compatible LLM provider.
//!
//! Works with OpenAI, Groq, OpenRouter, Ollama, and other compatible APIs.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::decode::{Accumulator, ChunkDecoder, DecodedStream};
use super::error::{LLMError, error_from_response};
use super::provider::{Endpoint, LLMProvider, cancellable, send_cancellable};
use super::types::{ChatChunk, ChatRequest, ChatStream, Message, UsageMeter};
use crate::sse_parser::SseEvent;

/// OpenAI-compatible provider.
pub struct OpenAICompatibleProvider {
    endpoint: Endpoint,
    include_usage: bool,
}

impl OpenAICompatibleProvider {
    pub fn new(endpoint: Endpoint, include_usage: bool) -> Self {
        Self {
            endpoint,
            include_usage,
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    async fn available(&self) -> Result<(), LLMError> {
        let url = format!("{}/models", self.endpoint.base_url);
        let mut req = self.endpoint.client.get(&url);
        if let Some(key) = self.endpoint.server_key() {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        self.endpoint.probe(req).await
    }

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, LLMError> {
        let url = format!("{}/chat/completions", self.endpoint.base_url);
        let key = self.endpoint.key_for(&request.caller)?;
        let meter = UsageMeter::start(&request, self.endpoint.cost_per_1k_tokens);

        let body = to_request(&request, self.include_usage);
        let mut req = self
            .endpoint
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = send_cancellable(req.json(&body), &cancel).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let decoder = OpenAIDecoder {
            acc: Accumulator::new(meter),
        };
        let stream = DecodedStream::new(Box::pin(response.bytes_stream()), decoder);
        Ok(cancellable(stream, cancel))
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
struct StreamRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

fn to_request(request: &ChatRequest, include_usage: bool) -> StreamRequest<'_> {
    StreamRequest {
        model: &request.model,
        messages: &request.messages,
        temperature: request.temperature,
        stream: true,
        stream_options: include_usage.then_some(StreamOptions {
            include_usage: true,
        }),
        user: request.caller.user_id.as_deref(),
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamUsage {
    total_tokens: u64,
}

#[derive(Deserialize)]
struct StreamErrorBody {
    message: String,
}

// ============================================================================
// Decoder
// ============================================================================

struct OpenAIDecoder {
    acc: Accumulator,
}

impl ChunkDecoder for OpenAIDecoder {
    fn decode(&mut self, event: SseEvent, out: &mut VecDeque<ChatChunk>) {
        if event.data == "[DONE]" {
            out.push_back(self.acc.done());
            return;
        }

        let chunk = match serde_json::from_str::<StreamChunk>(&event.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "Skipping unparseable stream chunk");
                return;
            }
        };

        if let Some(error) = chunk.error {
            out.push_back(ChatChunk::Error(error.message));
            return;
        }
        if let Some(usage) = chunk.usage {
            self.acc.report_tokens(usage.total_tokens);
        }
        if let Some(choice) = chunk.choices.into_iter().next()
            && let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            out.push_back(self.acc.delta(content));
        }
    }

    fn finish(&mut self) -> ChatChunk {
        ChatChunk::Error("upstream closed the stream before completion".to_string())
    }
}
