//! LLM provider clients for streaming chat completions.

mod anthropic;
mod decode;
mod gemini;
mod openai;

pub mod catalog;
pub mod error;
pub mod provider;
pub mod registry;
pub mod types;

pub use catalog::{Capabilities, ProviderCatalog, ProviderDescriptor, ProviderKind};
pub use error::LLMError;
pub use provider::{LLMProvider, build_provider};
pub use registry::{ProviderRegistry, ProviderView};
pub use types::{CallerContext, ChatChunk, ChatRequest, ChatStream, Message, Role, Usage};
