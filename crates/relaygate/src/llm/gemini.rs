//! Google Gemini provider (Generative Language API, SSE mode).

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

pub struct GeminiProvider {
    endpoint: Endpoint,
}

impl GeminiProvider {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    fn stream_url(&self, model: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.endpoint.base_url, model
        )
    }
}

#[async_trait]
impl LLMProvider for GeminiProvider {
    async fn available(&self) -> Result<(), LLMError> {
        let url = format!("{}/models", self.endpoint.base_url);
        let mut req = self.endpoint.client.get(&url);
        if let Some(key) = self.endpoint.server_key() {
            req = req.header("x-goog-api-key", key);
        }
        self.endpoint.probe(req).await
    }

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, LLMError> {
        let url = self.stream_url(&request.model);
        let key = self.endpoint.key_for(&request.caller)?;
        let meter = UsageMeter::start(&request, self.endpoint.cost_per_1k_tokens);

        let body = to_request(&request);
        let mut req = self
            .endpoint
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = key {
            req = req.header("x-goog-api-key", key);
        }

        let response = send_cancellable(req.json(&body), &cancel).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let decoder = GeminiDecoder {
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
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

fn to_request(request: &ChatRequest) -> GenerateRequest<'_> {
    let mut system = Vec::new();
    let mut contents = Vec::new();

    for msg in &request.messages {
        let part = Part { text: &msg.content };
        match msg.role {
            Role::System => system.push(part),
            Role::User => contents.push(Content {
                role: "user",
                parts: vec![part],
            }),
            Role::Assistant => contents.push(Content {
                role: "model",
                parts: vec![part],
            }),
        }
    }

    GenerateRequest {
        contents,
        system_instruction: (!system.is_empty()).then_some(SystemInstruction { parts: system }),
        generation_config: GenerationConfig {
            temperature: request.temperature,
        },
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    total_token_count: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Finish reasons that end the generation without a usable answer.
const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

// ============================================================================
// Decoder
// ============================================================================

struct GeminiDecoder {
    acc: Accumulator,
}

impl ChunkDecoder for GeminiDecoder {
    fn decode(&mut self, event: SseEvent, out: &mut VecDeque<ChatChunk>) {
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
        if let Some(usage) = chunk.usage_metadata {
            self.acc.report_tokens(usage.total_token_count);
        }

        for candidate in chunk.candidates.into_iter().take(1) {
            let texts = candidate
                .content
                .into_iter()
                .flat_map(|c| c.parts)
                .filter_map(|p| p.text)
                .filter(|t| !t.is_empty());
            for text in texts {
                out.push_back(self.acc.delta(text));
            }
            if let Some(reason) = candidate.finish_reason
                && BLOCKING_FINISH_REASONS.contains(&reason.as_str())
            {
                out.push_back(ChatChunk::Error(format!(
                    "generation stopped: {}",
                    reason.to_lowercase()
                )));
            }
        }
    }

    /// Gemini has no end marker; the stream simply closes.
    fn finish(&mut self) -> ChatChunk {
        self.acc.done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::catalog::{ProviderDescriptor, ProviderKind};
    use crate::llm::types::{CallerContext, Message};

    fn request(model: &str) -> ChatRequest {
        ChatRequest {
            provider: "gem".to_string(),
            model: model.to_string(),
            messages: vec![
                Message::new(Role::System, "Be brief."),
                Message::new(Role::User, "hi"),
                Message::new(Role::Assistant, "hello"),
            ],
            temperature: 0.3,
            stream: true,
            meta: Default::default(),
            caller: CallerContext::default(),
        }
    }

    fn decoder() -> GeminiDecoder {
        GeminiDecoder {
            acc: Accumulator::new(UsageMeter::start(&request("gemini-2.0-flash"), 0.0)),
        }
    }

    fn data(s: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: s.to_string(),
        }
    }

    #[test]
    fn url_strips_models_prefix() {
        let provider = GeminiProvider::new(Endpoint::new(
            reqwest::Client::new(),
            &ProviderDescriptor::new("gem", ProviderKind::Gemini),
            None,
        ));
        assert_eq!(
            provider.stream_url("models/gemini-2.0-flash"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn request_uses_camel_case_and_model_role() {
        let req = request("gemini-2.0-flash");
        let json = serde_json::to_value(to_request(&req)).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert!((json["generationConfig"]["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn decodes_candidates_and_closes_with_usage() {
        let mut d = decoder();
        let mut out = VecDeque::new();
        d.decode(
            data(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#),
            &mut out,
        );
        d.decode(
            data(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6}}"#),
            &mut out,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], ChatChunk::Delta("lo".to_string()));

        let ChatChunk::Done(usage) = d.finish() else {
            panic!("expected done chunk");
        };
        assert_eq!(usage.tokens, 6);
    }

    #[test]
    fn safety_stop_is_an_error() {
        let mut d = decoder();
        let mut out = VecDeque::new();
        d.decode(
            data(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#),
            &mut out,
        );
        assert_eq!(
            out.pop_front(),
            Some(ChatChunk::Error("generation stopped: safety".to_string()))
        );
    }

    #[test]
    fn decodes_error_payload() {
        let mut d = decoder();
        let mut out = VecDeque::new();
        d.decode(
            data(r#"{"error":{"code":400,"message":"API key not valid","status":"INVALID_ARGUMENT"}}"#),
            &mut out,
        );
        assert_eq!(
            out.pop_front(),
            Some(ChatChunk::Error("API key not valid".to_string()))
        );
    }
}
