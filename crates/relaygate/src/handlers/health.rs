use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};

use super::SERVICE_NAME;
use crate::server::AppState;

/// GET /healthz
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": SERVICE_NAME }))
}

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Not ready once shutdown has begun, so load balancers stop routing here.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.middleware.is_stopping() {
        (StatusCode::SERVICE_UNAVAILABLE, "stopping")
    } else {
        (StatusCode::OK, "ok")
    }
}

pub async fn version() -> Json<Value> {
    Json(json!({ "service": SERVICE_NAME, "version": env!("CARGO_PKG_VERSION") }))
}
