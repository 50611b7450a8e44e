//! Wire types for the relaygate streaming chat protocol.
//!
//! A chat call is a `POST /v1/chat` with a [`ChatRequestBody`]. The response is a
//! Server-Sent Events stream where every event carries one JSON-encoded
//! [`WireEvent`]:
//!
//! ```text
//! data: {"content":"Hel","done":false}
//!
//! data: {"content":"lo","done":false}
//!
//! data: {"done":true,"usage":{"provider":"oai","model":"gpt-4o-mini","tokens":12,"ms":840,"cost_usd":0.0000072}}
//! ```
//!
//! A failed stream ends with a single `{"error":"...","done":true}` event instead.
//! Exactly one terminal event is sent per stream and nothing follows it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Header carrying a caller-supplied provider key (bring your own key).
pub const HEADER_EXTERNAL_API_KEY: &str = "x-external-api-key";
/// Header carrying the caller's tenant id.
pub const HEADER_TENANT_ID: &str = "x-tenant-id";
/// Header carrying the caller's user id.
pub const HEADER_USER_ID: &str = "x-user-id";

// ============================================================================
// Request
// ============================================================================

/// Body of an inbound chat call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequestBody {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Ignored by the gateway: responses are always streamed.
    #[serde(default)]
    pub stream: bool,
    /// Opaque metadata passed through to the provider call.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// Pass-through headers (tenant id, user id, caller key). HTTP headers win on conflict.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

// ============================================================================
// Events
// ============================================================================

/// Usage reported on the terminal success event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub provider: String,
    pub model: String,
    pub tokens: u64,
    /// Wall time from call start to completion, in milliseconds.
    pub ms: u64,
    pub cost_usd: f64,
}

/// One event of a chat stream.
///
/// Variant order matters for deserialization: the untagged representation is
/// matched by the presence of `error`, then `usage`, then `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireEvent {
    Failed { error: String, done: bool },
    Completed { done: bool, usage: Usage },
    Delta { content: String, done: bool },
}

impl WireEvent {
    pub fn delta(content: impl Into<String>) -> Self {
        WireEvent::Delta {
            content: content.into(),
            done: false,
        }
    }

    pub fn completed(usage: Usage) -> Self {
        WireEvent::Completed { done: true, usage }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        WireEvent::Failed {
            error: error.into(),
            done: true,
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WireEvent::Delta { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
