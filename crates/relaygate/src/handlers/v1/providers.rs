use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::llm::ProviderView;
use crate::server::AppState;

#[derive(Serialize)]
pub struct ListProvidersResponse {
    providers: Vec<String>,
    config: serde_json::Map<String, serde_json::Value>,
}

/// GET /v1/providers
///
/// Names in catalog order plus the public part of each provider's config.
/// Keys are never included, only whether a server key is set.
pub async fn list_providers(State(state): State<AppState>) -> Json<ListProvidersResponse> {
    let config = state
        .registry
        .views()
        .into_iter()
        .map(|view: ProviderView| {
            let name = view.name.clone();
            let value = serde_json::to_value(&view).unwrap_or_default();
            (name, value)
        })
        .collect();

    Json(ListProvidersResponse {
        providers: state.registry.list_providers(),
        config,
    })
}
