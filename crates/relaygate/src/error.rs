//! Request-scoped gateway errors and their HTTP mapping.
//!
//! These are the failures that can happen before a stream opens. Anything
//! after that point is reported in-band as a single failure event.

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::llm::LLMError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed request.
    #[error("{0}")]
    Validation(String),

    /// Unknown provider name.
    #[error("provider '{0}' not found")]
    NotFound(String),

    /// Failed health check, open circuit, or shutdown in progress.
    #[error("{0}")]
    Unavailable(String),

    /// Admission rejected for the current window.
    #[error("rate limit exceeded for provider '{provider}'")]
    RateLimited {
        provider: String,
        retry_after: Duration,
    },

    /// Provider failed while setting up the stream.
    #[error("upstream error: {0}")]
    Upstream(#[from] LLMError),

    /// Local encoding or write failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Upstream(_) => "upstream",
            GatewayError::Transport(_) => "transport",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        let mut response = (status, Json(body)).into_response();

        if let GatewayError::RateLimited { retry_after, .. } = &self {
            // Round up so clients never retry inside the window
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let response = GatewayError::NotFound("foo".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "provider 'foo' not found");
        assert_eq!(json["kind"], "not_found");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let response = GatewayError::RateLimited {
            provider: "oai".to_string(),
            retry_after: Duration::from_millis(2_500),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            GatewayError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::unavailable("x").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Upstream(LLMError::MissingCredential).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Transport("x".to_string()).kind(),
            "transport"
        );
    }
}
