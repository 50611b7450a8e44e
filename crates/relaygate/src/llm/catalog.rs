//! Provider catalog: the static list of backends the gateway may call.
//!
//! The catalog is a YAML file read once at startup:
//!
//! ```yaml
//! providers:
//!   - name: oai
//!     type: openai
//!     key_env: OPENAI_API_KEY
//!     default_model: gpt-4o-mini
//!   - name: claude
//!     type: anthropic
//!     key_env: ANTHROPIC_API_KEY
//! ```
//!
//! Entry order is preserved and becomes the order of provider listings.

use std::collections::HashSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::{ConfigError, RateLimitSettings};

// ============================================================================
// ProviderKind
// ============================================================================

/// Backend protocol family. This is a closed set; the registry picks the
/// client implementation from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Groq,
    OpenRouter,
    Ollama,
    #[serde(alias = "claude")]
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Ollama => "http://localhost:11434/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    /// Whether calls fail without any credential.
    pub fn requires_key(self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Groq => "groq",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ProviderDescriptor
// ============================================================================

/// One catalog entry. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the server's key.
    #[serde(default)]
    pub key_env: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    /// Overrides the gateway-wide admission budget for this provider.
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            base_url: None,
            key_env: None,
            default_model: None,
            cost_per_1k_tokens: 0.0,
            rate_limit: None,
            capabilities: Capabilities::default(),
        }
    }

    /// Configured base URL, or the default for the provider type.
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
            .trim_end_matches('/')
    }
}

/// Capability flags of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// The backend can stream. Chat calls to a provider without it are refused.
    #[serde(default = "default_true")]
    pub streaming: bool,
    /// Accept caller-supplied keys.
    #[serde(default = "default_true")]
    pub byok: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            byok: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// ProviderCatalog
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ProviderCatalog {
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
}

impl ProviderCatalog {
    /// Read and validate a catalog file. A missing file is an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ConfigError::MissingCatalog(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let catalog: Self = serde_saphyr::from_str(contents)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for descriptor in &self.providers {
            validate_descriptor(descriptor)?;
            if !seen.insert(descriptor.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(descriptor.name.clone()));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_descriptor(descriptor: &ProviderDescriptor) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidProvider {
        name: descriptor.name.clone(),
        reason: reason.to_string(),
    };

    if descriptor.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if let Some(ref base_url) = descriptor.base_url {
        let parsed = url::Url::parse(base_url).map_err(|e| invalid(&format!("base_url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("base_url must use http or https"));
        }
    }
    if descriptor.cost_per_1k_tokens < 0.0 {
        return Err(invalid("cost_per_1k_tokens must not be negative"));
    }
    if let Some(ref rate_limit) = descriptor.rate_limit
        && let Err(reason) = rate_limit.validate()
    {
        return Err(invalid(&format!("rate_limit: {reason}")));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
