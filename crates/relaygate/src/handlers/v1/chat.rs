use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use relaygate_protocol::ChatRequestBody;

use crate::error::GatewayError;
use crate::server::AppState;
use crate::transport;

/// POST /v1/chat
///
/// Streams the completion as SSE events:
/// - `{"content": "...", "done": false}` per content delta
/// - `{"done": true, "usage": {...}}` on success
/// - `{"error": "...", "done": true}` on failure
///
/// Failures before the stream opens are JSON error responses instead.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatRequestBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return GatewayError::validation(rejection.body_text()).into_response();
        }
    };

    let request = match transport::build_request(body, &headers, &state.streaming) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    transport::serve(&state, request).await
}
