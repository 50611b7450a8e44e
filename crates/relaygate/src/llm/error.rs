//! LLM error types.

use thiserror::Error;

/// Check an HTTP response for rate-limit errors, returning `RateLimit` for 429.
pub fn check_response_error(response: &reqwest::Response) -> Option<LLMError> {
    if response.status().is_success() {
        return None;
    }
    if response.status().as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Some(LLMError::RateLimit { retry_after });
    }
    None
}

/// Turn a non-success response into an `LLMError`, consuming the body for the message.
pub async fn error_from_response(response: reqwest::Response) -> LLMError {
    if let Some(err) = check_response_error(&response) {
        return err;
    }
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    LLMError::Api { status, message }
}

/// Errors that can occur when making LLM API calls.
#[derive(Debug, Error)]
pub enum LLMError {
    /// HTTP request failed
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// API returned an error response
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Rate limited upstream (429)
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimit { retry_after: Option<u64> },

    /// Health probe failed
    #[error("health check failed: {0}")]
    Unhealthy(String),

    /// No credential available for a provider that needs one
    #[error("no api key configured; supply one with the x-external-api-key header")]
    MissingCredential,

    /// The call was cancelled before the stream opened
    #[error("request cancelled")]
    Cancelled,
}

impl LLMError {
    /// Whether the call failed because of what the caller sent (missing or
    /// rejected key, unknown model, malformed request) rather than because the
    /// backend misbehaved. Caller errors must not count against the backend.
    pub fn is_caller_error(&self) -> bool {
        match self {
            LLMError::MissingCredential => true,
            LLMError::Api { status, .. } => (400..500).contains(status) && *status != 429,
            LLMError::Request(_)
            | LLMError::RateLimit { .. }
            | LLMError::Unhealthy(_)
            | LLMError::Cancelled => false,
        }
    }
}
