use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderName, Method, StatusCode, header};
use axum::routing::{get, post};
use relaygate_protocol::{HEADER_EXTERNAL_API_KEY, HEADER_TENANT_ID, HEADER_USER_ID};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::config::{Config, ServerConfig, StreamingSettings};
use crate::handlers;
use crate::llm::ProviderRegistry;
use crate::production::{ProductionConfig, ProductionMiddleware};

/// Shared application state.
///
/// Built once at startup and handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub middleware: Arc<ProductionMiddleware>,
    pub streaming: StreamingSettings,
    pub keep_alive_interval: Duration,
}

impl AppState {
    /// Wire the registry to a new middleware, registering every provider with
    /// its own admission budget when the catalog sets one.
    pub fn new(config: &Config, registry: ProviderRegistry) -> Self {
        let middleware = ProductionMiddleware::new(ProductionConfig::from(&config.production));
        for descriptor in registry.descriptors() {
            match descriptor.rate_limit {
                Some(ref limit) => middleware.register_provider_with(&descriptor.name, limit.clone()),
                None => middleware.register_provider(&descriptor.name),
            }
        }

        Self {
            registry: Arc::new(registry),
            middleware: Arc::new(middleware),
            streaming: config.streaming.clone(),
            keep_alive_interval: Duration::from_secs(config.server.keep_alive_interval_seconds),
        }
    }
}

pub fn build_app(state: AppState, server: &ServerConfig) -> Router {
    let api_v1 = Router::new()
        .route("/chat", post(handlers::v1::chat))
        .route("/advise", post(handlers::v1::advise))
        .route("/providers", get(handlers::v1::list_providers))
        .route("/status", get(handlers::v1::status));

    let app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/version", get(handlers::version))
        .nest("/v1", api_v1)
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.request_timeout_seconds),
        ));

    if server.cors_enabled {
        app.layer(cors_layer())
    } else {
        app
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(HEADER_EXTERNAL_API_KEY),
            HeaderName::from_static(HEADER_TENANT_ID),
            HeaderName::from_static(HEADER_USER_ID),
        ])
}

/// Resolve on SIGINT or SIGTERM, after draining the middleware.
pub async fn shutdown_signal(middleware: Arc<ProductionMiddleware>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }

    let report = middleware.stop().await;
    info!(
        drained = report.drained,
        forced = report.forced,
        "Streams closed, shutting down server"
    );
}
