//! LLM provider trait and shared HTTP plumbing for the built-in backends.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use super::anthropic::AnthropicProvider;
use super::catalog::{ProviderDescriptor, ProviderKind};
use super::error::LLMError;
use super::gemini::GeminiProvider;
use super::openai::OpenAICompatibleProvider;
use super::types::{CallerContext, ChatChunk, ChatRequest, ChatStream};

/// Capability set every backend implements.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Probe the backend. Fails when it cannot be reached.
    async fn available(&self) -> Result<(), LLMError>;

    /// Open a streaming chat completion.
    ///
    /// Errors are returned only for failures before the stream opens. After
    /// that, failures arrive as a single [`ChatChunk::Error`]. Cancelling
    /// `cancel` ends the stream without further chunks.
    async fn chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, LLMError>;
}

/// Build the client for a catalog entry.
pub fn build_provider(
    client: Client,
    descriptor: &ProviderDescriptor,
    server_key: Option<SecretString>,
) -> Arc<dyn LLMProvider> {
    let endpoint = Endpoint::new(client, descriptor, server_key);
    match descriptor.kind {
        ProviderKind::OpenAI | ProviderKind::Groq | ProviderKind::OpenRouter => {
            Arc::new(OpenAICompatibleProvider::new(endpoint, true))
        }
        // Older Ollama builds reject `stream_options`
        ProviderKind::Ollama => Arc::new(OpenAICompatibleProvider::new(endpoint, false)),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(endpoint)),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(endpoint)),
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Connection settings shared by the HTTP backends.
pub struct Endpoint {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    server_key: Option<SecretString>,
    byok: bool,
    requires_key: bool,
    pub(crate) cost_per_1k_tokens: f64,
}

impl Endpoint {
    pub fn new(
        client: Client,
        descriptor: &ProviderDescriptor,
        server_key: Option<SecretString>,
    ) -> Self {
        Self {
            client,
            base_url: descriptor.base_url().to_string(),
            server_key,
            byok: descriptor.capabilities.byok,
            requires_key: descriptor.kind.requires_key(),
            cost_per_1k_tokens: descriptor.cost_per_1k_tokens,
        }
    }

    pub fn server_key(&self) -> Option<&str> {
        self.server_key.as_ref().map(|k| k.expose_secret())
    }

    /// Key for a call: the caller's own key when BYOK is allowed, else the server key.
    pub fn key_for<'a>(&'a self, caller: &'a CallerContext) -> Result<Option<&'a str>, LLMError> {
        let key = caller
            .api_key()
            .filter(|_| self.byok)
            .or_else(|| self.server_key());
        match key {
            None if self.requires_key => Err(LLMError::MissingCredential),
            key => Ok(key),
        }
    }

    /// Send a health probe.
    ///
    /// Network failures and 5xx responses mean unavailable. Any other status
    /// proves the backend is reachable; credentials are checked by the real call
    /// since callers may bring their own key.
    pub async fn probe(&self, request: RequestBuilder) -> Result<(), LLMError> {
        let response = request
            .send()
            .await
            .map_err(|e| LLMError::Unhealthy(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(LLMError::Unhealthy(format!("status {}", status.as_u16())));
        }
        Ok(())
    }
}

/// Send a request unless `cancel` fires first.
pub async fn send_cancellable(
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<Response, LLMError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LLMError::Cancelled),
        result = request.send() => Ok(result?),
    }
}

/// Box a chunk stream that ends as soon as `cancel` fires.
pub fn cancellable<S>(stream: S, cancel: CancellationToken) -> ChatStream
where
    S: Stream<Item = ChatChunk> + Send + 'static,
{
    Box::pin(stream.take_until(cancel.cancelled_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(kind: ProviderKind, server_key: Option<&str>, byok: bool) -> Endpoint {
        let mut descriptor = ProviderDescriptor::new("p", kind);
        descriptor.capabilities.byok = byok;
        Endpoint::new(
            Client::new(),
            &descriptor,
            server_key.map(|k| SecretString::from(k.to_string())),
        )
    }

    fn caller(key: Option<&str>) -> CallerContext {
        CallerContext {
            api_key: key.map(|k| SecretString::from(k.to_string())),
            ..Default::default()
        }
    }

    #[test]
    fn caller_key_overrides_server_key() {
        let ep = endpoint(ProviderKind::OpenAI, Some("server"), true);
        assert_eq!(ep.key_for(&caller(Some("mine"))).unwrap(), Some("mine"));
        assert_eq!(ep.key_for(&caller(None)).unwrap(), Some("server"));
    }

    #[test]
    fn caller_key_ignored_without_byok() {
        let ep = endpoint(ProviderKind::OpenAI, Some("server"), false);
        assert_eq!(ep.key_for(&caller(Some("mine"))).unwrap(), Some("server"));
    }

    #[test]
    fn missing_key_fails_only_when_required() {
        let ep = endpoint(ProviderKind::Anthropic, None, true);
        assert!(matches!(
            ep.key_for(&caller(None)),
            Err(LLMError::MissingCredential)
        ));

        let ollama = endpoint(ProviderKind::Ollama, None, true);
        assert_eq!(ollama.key_for(&caller(None)).unwrap(), None);
    }

    #[tokio::test]
    async fn cancellable_stream_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let mut stream = cancellable(
            futures::stream::iter(vec![ChatChunk::Delta("a".to_string())])
                .chain(futures::stream::pending()),
            cancel.clone(),
        );
        assert_eq!(stream.next().await, Some(ChatChunk::Delta("a".to_string())));
        cancel.cancel();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn send_is_abandoned_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = Client::new().get("http://10.255.255.1:9/");
        let result = send_cancellable(request, &cancel).await;
        assert!(matches!(result, Err(LLMError::Cancelled)));
    }
}
