//! Provider registry: catalog entries bound to their client implementations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use reqwest::Client;
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};

use super::catalog::{
    Capabilities, ProviderCatalog, ProviderDescriptor, ProviderKind, validate_descriptor,
};
use super::provider::{LLMProvider, build_provider};
use crate::config::ConfigError;

struct Entry {
    descriptor: ProviderDescriptor,
    has_server_key: bool,
    provider: Arc<dyn LLMProvider>,
}

/// Registry of LLM providers, keyed by catalog name.
///
/// Read-only once the server starts. Listing order is catalog order.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the catalog at `path` and build a client for every entry.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let catalog = ProviderCatalog::load(path).await?;
        Self::from_catalog(catalog)
    }

    /// Build clients for a parsed catalog, reading server keys from the environment.
    pub fn from_catalog(catalog: ProviderCatalog) -> Result<Self, ConfigError> {
        let client = Client::new();
        let mut registry = Self::new();

        for descriptor in catalog.providers {
            let server_key = server_key(&descriptor);
            let has_server_key = server_key.is_some();
            let provider = build_provider(client.clone(), &descriptor, server_key);
            info!(
                provider = %descriptor.name,
                kind = %descriptor.kind,
                base_url = %descriptor.base_url(),
                server_key = has_server_key,
                "Registered provider"
            );
            registry.insert(descriptor, has_server_key, provider)?;
        }

        if registry.entries.is_empty() {
            warn!("Provider catalog is empty; every chat request will be rejected");
        }
        Ok(registry)
    }

    /// Register a provider implementation under its descriptor's name.
    pub fn register(
        &mut self,
        descriptor: ProviderDescriptor,
        provider: Arc<dyn LLMProvider>,
    ) -> Result<(), ConfigError> {
        validate_descriptor(&descriptor)?;
        self.insert(descriptor, false, provider)
    }

    fn insert(
        &mut self,
        descriptor: ProviderDescriptor,
        has_server_key: bool,
        provider: Arc<dyn LLMProvider>,
    ) -> Result<(), ConfigError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(ConfigError::DuplicateProvider(descriptor.name));
        }
        self.index.insert(descriptor.name.clone(), self.entries.len());
        self.entries.push(Entry {
            descriptor,
            has_server_key,
            provider,
        });
        Ok(())
    }

    /// Get a provider by catalog name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn LLMProvider>> {
        self.index
            .get(name)
            .map(|&i| Arc::clone(&self.entries[i].provider))
    }

    pub fn descriptor(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.index.get(name).map(|&i| &self.entries[i].descriptor)
    }

    /// Registered names in catalog order.
    pub fn list_providers(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    /// Public description of every provider, without secrets.
    pub fn views(&self) -> Vec<ProviderView> {
        self.entries
            .iter()
            .map(|e| ProviderView {
                name: e.descriptor.name.clone(),
                kind: e.descriptor.kind,
                base_url: e.descriptor.base_url().to_string(),
                default_model: e.descriptor.default_model.clone(),
                capabilities: e.descriptor.capabilities,
                server_key: e.has_server_key,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn server_key(descriptor: &ProviderDescriptor) -> Option<SecretString> {
    let var = descriptor.key_env.as_deref()?;
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Some(SecretString::from(value)),
        _ => {
            warn!(
                provider = %descriptor.name,
                key_env = var,
                "Server key not set; only caller-supplied keys will work"
            );
            None
        }
    }
}

/// Provider entry as exposed by `GET /v1/providers`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderView {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub capabilities: Capabilities,
    /// Whether a server-side key is configured.
    pub server_key: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::error::LLMError;
    use crate::llm::types::{ChatRequest, ChatStream};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NullProvider;

    #[async_trait]
    impl LLMProvider for NullProvider {
        async fn available(&self) -> Result<(), LLMError> {
            Ok(())
        }

        async fn chat(
            &self,
            _request: ChatRequest,
            _cancel: CancellationToken,
        ) -> Result<ChatStream, LLMError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[test]
    fn from_catalog_keeps_order() {
        let catalog = ProviderCatalog::parse(
            "providers:\n  - name: zeta\n    type: groq\n  - name: alpha\n    type: ollama\n  - name: mid\n    type: gemini\n",
        )
        .unwrap();
        let registry = ProviderRegistry::from_catalog(catalog).unwrap();
        assert_eq!(registry.list_providers(), ["zeta", "alpha", "mid"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.resolve("alpha").is_some());
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn views_hide_keys() {
        let catalog = ProviderCatalog::parse(
            "providers:\n  - name: oai\n    type: openai\n    key_env: RELAYGATE_TEST_UNSET_KEY_VAR\n    default_model: gpt-4o-mini\n",
        )
        .unwrap();
        let registry = ProviderRegistry::from_catalog(catalog).unwrap();
        let views = registry.views();
        assert_eq!(views.len(), 1);
        assert!(!views[0].server_key);

        let json = serde_json::to_value(&views[0]).unwrap();
        assert_eq!(json["type"], "openai");
        assert_eq!(json["base_url"], "https://api.openai.com/v1");
        assert_eq!(json["capabilities"]["byok"], true);
        assert!(json.get("key_env").is_none());
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(
                ProviderDescriptor::new("mock", ProviderKind::OpenAI),
                Arc::new(NullProvider),
            )
            .unwrap();
        let err = registry
            .register(
                ProviderDescriptor::new("mock", ProviderKind::Groq),
                Arc::new(NullProvider),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProvider(ref n) if n == "mock"));
        assert_eq!(registry.list_providers(), ["mock"]);
    }

    #[test]
    fn empty_registry() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list_providers().is_empty());
        assert!(registry.descriptor("any").is_none());
    }
}
