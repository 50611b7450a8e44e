use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::handlers::SERVICE_NAME;
use crate::production::ProductionStatus;
use crate::server::AppState;

#[derive(Serialize)]
pub struct StatusResponse {
    service: &'static str,
    status: &'static str,
    providers: Vec<String>,
    production_features: ProductionStatus,
}

/// GET /v1/status
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let production = state.middleware.status();
    Json(StatusResponse {
        service: SERVICE_NAME,
        status: if production.stopping {
            "stopping"
        } else {
            "healthy"
        },
        providers: state.registry.list_providers(),
        production_features: production,
    })
}
