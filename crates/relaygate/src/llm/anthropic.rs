//! Anthropic LLM provider with native API format.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::decode::{Accumulator, ChunkDecoder, DecodedStream};
use super::error::{LLMError, error_from_response};
use super::provider::{Endpoint, LLMProvider, cancellable, send_cancellable};
use super::types::{ChatChunk, ChatRequest, ChatStream, Role, UsageMeter};
use crate::sse_parser::SseEvent;

/// Anthropic provider with native API format.
pub struct AnthropicProvider {
    endpoint: Endpoint,
    api_version: String,
}

impl AnthropicProvider {
    pub const DEFAULT_API_VERSION: &'static str = "2023-06-01";
    pub const DEFAULT_MAX_TOKENS: u32 = 4096;

    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            api_version: Self::DEFAULT_API_VERSION.to_string(),
        }
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn available(&self) -> Result<(), LLMError> {
        let url = format!("{}/v1/models", self.endpoint.base_url);
        let mut req = self
            .endpoint
            .client
            .get(&url)
            .header("anthropic-version", &self.api_version);
        if let Some(key) = self.endpoint.server_key() {
            req = req.header("x-api-key", key);
        }
        self.endpoint.probe(req).await
    }

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, LLMError> {
        let url = format!("{}/v1/messages", self.endpoint.base_url);
        let key = self.endpoint.key_for(&request.caller)?;
        let meter = UsageMeter::start(&request, self.endpoint.cost_per_1k_tokens);

        let body = to_stream_request(&request);
        let mut req = self
            .endpoint
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("anthropic-version", &self.api_version);
        if let Some(key) = key {
            req = req.header("x-api-key", key);
        }

        let response = send_cancellable(req.json(&body), &cancel).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let decoder = AnthropicDecoder {
            acc: Accumulator::new(meter),
        };
        let stream = DecodedStream::new(Box::pin(response.bytes_stream()), decoder);
        Ok(cancellable(stream, cancel))
    }
}

// --- Request types ---

#[derive(Serialize)]
struct StreamRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<RequestMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

// --- Conversions ---

fn to_stream_request(request: &ChatRequest) -> StreamRequest<'_> {
    let mut system: Vec<&str> = Vec::new();
    let mut messages = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => system.push(&msg.content),
            Role::User => messages.push(RequestMessage {
                role: "user",
                content: &msg.content,
            }),
            Role::Assistant => messages.push(RequestMessage {
                role: "assistant",
                content: &msg.content,
            }),
        }
    }

    StreamRequest {
        model: &request.model,
        max_tokens: AnthropicProvider::DEFAULT_MAX_TOKENS,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        messages,
        // The Messages API accepts 0.0..=1.0
        temperature: request.temperature.clamp(0.0, 1.0),
        stream: true,
    }
}

// --- Streaming ---

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<OutputUsage>,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Option<InputUsage>,
}

#[derive(Deserialize)]
struct InputUsage {
    #[serde(default)]
    input_tokens: u64,
}

#[derive(Deserialize)]
struct OutputUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct Delta {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

struct AnthropicDecoder {
    acc: Accumulator,
}

impl ChunkDecoder for AnthropicDecoder {
    fn decode(&mut self, event: SseEvent, out: &mut VecDeque<ChatChunk>) {
        let event = match serde_json::from_str::<StreamEvent>(&event.data) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Skipping unparseable stream event");
                return;
            }
        };

        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.acc.add_tokens(usage.input_tokens);
                }
            }
            StreamEvent::ContentBlockDelta { delta } => {
                if let Some(text) = delta.text
                    && !text.is_empty()
                {
                    out.push_back(self.acc.delta(text));
                }
            }
            StreamEvent::MessageDelta { usage: Some(u) } => self.acc.add_tokens(u.output_tokens),
            StreamEvent::MessageStop => out.push_back(self.acc.done()),
            StreamEvent::Error { error } => out.push_back(ChatChunk::Error(error.message)),
            StreamEvent::MessageDelta { usage: None } | StreamEvent::Unknown => {}
        }
    }

    fn finish(&mut self) -> ChatChunk {
        ChatChunk::Error("upstream closed the stream before message_stop".to_string())
    }
}
