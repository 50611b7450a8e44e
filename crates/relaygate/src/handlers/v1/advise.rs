use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::advise::{self, AdviseMode, AdviseRequestBody};
use crate::error::GatewayError;
use crate::server::AppState;
use crate::transport;

#[derive(Deserialize)]
pub struct AdviseQuery {
    #[serde(default)]
    mode: String,
}

/// POST /v1/advise?mode=exec|code|ops|community
pub async fn advise(
    State(state): State<AppState>,
    Query(query): Query<AdviseQuery>,
    headers: HeaderMap,
    body: Result<Json<AdviseRequestBody>, JsonRejection>,
) -> Response {
    let mode: AdviseMode = match query.mode.parse() {
        Ok(mode) => mode,
        Err(e) => return e.into_response(),
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return GatewayError::validation(rejection.body_text()).into_response();
        }
    };

    let request = match advise::build_request(mode, body, &headers, &state.streaming) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    transport::serve(&state, request).await
}
