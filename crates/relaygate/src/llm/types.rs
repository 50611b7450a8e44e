//! Common types for streaming chat completions.

use std::pin::Pin;
use std::time::Instant;

use futures::Stream;
use secrecy::{ExposeSecret, SecretString};

pub use relaygate_protocol::{Message, Role, Usage};

/// A chat completion request as handed to a provider client.
///
/// Built per call by the transport and dropped when the call ends.
#[derive(Debug)]
pub struct ChatRequest {
    /// Catalog name of the provider (not the backend type).
    pub provider: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub stream: bool,
    /// Opaque metadata from the caller.
    pub meta: serde_json::Map<String, serde_json::Value>,
    pub caller: CallerContext,
}

impl ChatRequest {
    /// Total characters across all message contents.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

/// Caller identity passed through from request headers.
///
/// These values are forwarded to the provider call only. They are never logged.
#[derive(Debug, Default)]
pub struct CallerContext {
    /// Caller-supplied provider key (BYOK).
    pub api_key: Option<SecretString>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
}

impl CallerContext {
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|k| k.expose_secret())
    }
}

/// One item of a provider stream.
///
/// `Done` and `Error` are terminal: a stream yields at most one of them and
/// nothing after it.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatChunk {
    /// Content delta (may be empty).
    Delta(String),
    /// Successful completion with usage.
    Done(Usage),
    /// Mid-stream failure.
    Error(String),
}

impl ChatChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChatChunk::Delta(_))
    }
}

/// A lazy, finite, non-restartable stream of chunks from a provider.
pub type ChatStream = Pin<Box<dyn Stream<Item = ChatChunk> + Send>>;

/// Builds the [`Usage`] record for a call.
///
/// Uses upstream token counts when the provider reports them and falls back to
/// a four-characters-per-token estimate otherwise.
#[derive(Debug, Clone)]
pub struct UsageMeter {
    provider: String,
    model: String,
    cost_per_1k_tokens: f64,
    prompt_chars: usize,
    started: Instant,
}

impl UsageMeter {
    pub fn start(request: &ChatRequest, cost_per_1k_tokens: f64) -> Self {
        Self {
            provider: request.provider.clone(),
            model: request.model.clone(),
            cost_per_1k_tokens,
            prompt_chars: request.prompt_chars(),
            started: Instant::now(),
        }
    }

    pub fn finish(&self, reported_tokens: Option<u64>, completion_chars: usize) -> Usage {
        let tokens = match reported_tokens {
            Some(t) if t > 0 => t,
            _ => estimate_tokens(self.prompt_chars + completion_chars),
        };
        Usage {
            provider: self.provider.clone(),
            model: self.model.clone(),
            tokens,
            ms: self.started.elapsed().as_millis() as u64,
            cost_usd: tokens as f64 / 1000.0 * self.cost_per_1k_tokens,
        }
    }
}

fn estimate_tokens(chars: usize) -> u64 {
    chars.div_ceil(4) as u64
}
