//! End-to-end tests through the HTTP router with scripted providers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use futures::StreamExt;
use http_body_util::BodyExt;
use relaygate::config::{
    CircuitBreakerSettings, Config, ProductionSettings, RateLimitSettings,
};
use relaygate::llm::provider::cancellable;
use relaygate::production::CircuitStatus;
use relaygate::llm::{
    ChatChunk, ChatRequest, ChatStream, LLMError, LLMProvider, Message, ProviderDescriptor,
    ProviderKind, ProviderRegistry, Role, Usage,
};
use relaygate::server::{AppState, build_app};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct Scripted {
    chunks: Vec<ChatChunk>,
    unhealthy: AtomicBool,
    /// Keep the stream open after the scripted chunks.
    hang: bool,
    /// Delay before each chunk.
    pace: Duration,
    /// Refuse calls that carry no caller key, like a backend without a server key.
    require_key: bool,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<Message>>,
}

impl Scripted {
    fn new(chunks: Vec<ChatChunk>) -> Arc<Self> {
        Arc::new(Self {
            chunks,
            ..Default::default()
        })
    }

    fn unhealthy() -> Arc<Self> {
        let provider = Self::default();
        provider.unhealthy.store(true, Ordering::SeqCst);
        Arc::new(provider)
    }

    fn hanging(text: &str) -> Arc<Self> {
        Arc::new(Self {
            chunks: vec![ChatChunk::Delta(text.to_string())],
            hang: true,
            ..Default::default()
        })
    }

    fn keyed(text: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            require_key: true,
            ..Self::script(text)
        })
    }

    fn paced(text: &[&str], pace: Duration) -> Arc<Self> {
        Arc::new(Self {
            pace,
            ..Self::script(text)
        })
    }

    fn replying(text: &[&str]) -> Arc<Self> {
        Arc::new(Self::script(text))
    }

    fn script(text: &[&str]) -> Self {
        let mut chunks: Vec<_> = text
            .iter()
            .map(|t| ChatChunk::Delta(t.to_string()))
            .collect();
        chunks.push(ChatChunk::Done(Usage {
            provider: "mock".to_string(),
            model: "m".to_string(),
            tokens: 12,
            ms: 3,
            cost_usd: 0.0,
        }));
        Self {
            chunks,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LLMProvider for Scripted {
    async fn available(&self) -> Result<(), LLMError> {
        if self.unhealthy.load(Ordering::SeqCst) {
            Err(LLMError::Unhealthy("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, LLMError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.require_key && request.caller.api_key.is_none() {
            return Err(LLMError::MissingCredential);
        }
        *self.last_messages.lock().unwrap() = request.messages;

        let pace = self.pace;
        let scripted = futures::stream::iter(self.chunks.clone()).then(move |chunk| async move {
            tokio::time::sleep(pace).await;
            chunk
        });
        let stream: ChatStream = if self.hang {
            Box::pin(scripted.chain(futures::stream::pending()))
        } else {
            Box::pin(scripted)
        };
        Ok(cancellable(stream, cancel))
    }
}

fn production(limit: u32, threshold: u32) -> ProductionSettings {
    ProductionSettings {
        rate_limit: RateLimitSettings {
            requests_per_window: limit,
            window_seconds: 60,
        },
        circuit_breaker: CircuitBreakerSettings {
            failure_threshold: threshold,
            cooldown_seconds: 30,
        },
        ..Default::default()
    }
}

fn gateway(providers: Vec<(&str, Arc<Scripted>)>, settings: ProductionSettings) -> (Router, AppState) {
    let descriptors = providers
        .into_iter()
        .map(|(name, provider)| (ProviderDescriptor::new(name, ProviderKind::OpenAI), provider))
        .collect();
    gateway_with(descriptors, settings)
}

fn gateway_with(
    providers: Vec<(ProviderDescriptor, Arc<Scripted>)>,
    settings: ProductionSettings,
) -> (Router, AppState) {
    let mut registry = ProviderRegistry::new();
    for (descriptor, provider) in providers {
        registry.register(descriptor, provider).unwrap();
    }
    let config = Config {
        production: settings,
        ..Default::default()
    };
    let state = AppState::new(&config, registry);
    (build_app(state.clone(), &config.server), state)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn chat_body(provider: &str) -> Value {
    json!({
        "provider": provider,
        "model": "m",
        "messages": [{"role": "user", "content": "hello"}]
    })
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Data payloads of an SSE body, skipping keep-alive comments.
async fn sse_events(response: axum::response::Response) -> Vec<Value> {
    body_text(response)
        .await
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test]
async fn chat_streams_deltas_then_usage() {
    let provider = Scripted::replying(&["Hel", "", "lo"]);
    let (app, _) = gateway(vec![("mock", provider.clone())], production(10, 5));

    let response = app.oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let events = sse_events(response).await;
    assert_eq!(events.len(), 3, "empty deltas are not sent: {events:?}");
    assert_eq!(events[0], json!({"content": "Hel", "done": false}));
    assert_eq!(events[1], json!({"content": "lo", "done": false}));
    assert_eq!(events[2]["done"], true);
    assert!(events[2]["usage"]["tokens"].as_u64().unwrap() > 0);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let (app, _) = gateway(vec![("mock", Scripted::replying(&["hi"]))], production(10, 5));

    let response = app.oneshot(post("/v1/chat", chat_body("nope"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "not_found");
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let provider = Scripted::replying(&["hi"]);
    let (app, _) = gateway(vec![("mock", provider.clone())], production(10, 5));

    let missing_model = post("/v1/chat", json!({"provider": "mock", "messages": []}));
    let response = app.clone().oneshot(missing_model).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["kind"], "validation");

    let not_json = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(not_json).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn over_limit_call_is_rejected_without_reaching_provider() {
    let provider = Scripted::replying(&["hi"]);
    let (app, _) = gateway(vec![("mock", provider.clone())], production(2, 5));

    for _ in 0..2 {
        let response = app.clone().oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        sse_events(response).await;
    }

    let response = app.oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(body_json(response).await["kind"], "rate_limited");
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn mid_stream_error_is_one_terminal_event_and_opens_circuit() {
    let provider = Scripted::new(vec![
        ChatChunk::Delta("partial".to_string()),
        ChatChunk::Error("upstream exploded".to_string()),
        ChatChunk::Delta("never sent".to_string()),
    ]);
    let (app, _) = gateway(vec![("mock", provider.clone())], production(10, 1));

    let response = app.clone().oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_events(response).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["content"], "partial");
    assert_eq!(events[1], json!({"error": "upstream exploded", "done": true}));

    // Threshold of one: the circuit is now open and fails fast
    let response = app.oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["kind"], "unavailable");
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn failed_health_probe_is_unavailable_and_counted() {
    let provider = Scripted::unhealthy();
    let (app, state) = gateway(vec![("mock", provider.clone())], production(10, 5));

    let response = app.oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("connection refused"));
    assert_eq!(provider.calls(), 0);

    let status = state.middleware.status();
    assert_eq!(status.providers[0].stats.failed, 1);
    assert_eq!(status.providers[0].consecutive_failures, 1);
    assert_eq!(status.in_flight, 0);
}

#[tokio::test]
async fn stopped_gateway_rejects_new_calls() {
    let provider = Scripted::replying(&["hi"]);
    let (app, state) = gateway(vec![("mock", provider.clone())], production(10, 5));

    let report = state.middleware.stop().await;
    assert_eq!(report.forced, 0);

    let response = app.clone().oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let status = body_json(app.oneshot(get("/v1/status")).await.unwrap()).await;
    assert_eq!(status["status"], "stopping");
    assert_eq!(status["production_features"]["stopping"], true);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn keyless_callers_do_not_trip_the_circuit_for_others() {
    let provider = Scripted::keyed(&["hi"]);
    let (app, state) = gateway(vec![("mock", provider.clone())], production(10, 2));

    for _ in 0..3 {
        let response = app.clone().oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "validation");
    }

    let mut keyed = post("/v1/chat", chat_body("mock"));
    keyed
        .headers_mut()
        .insert("x-external-api-key", "sk-caller".parse().unwrap());
    let response = app.oneshot(keyed).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sse_events(response).await.last().unwrap()["done"], true);

    let snap = &state.middleware.status().providers[0];
    assert_eq!(snap.stats.caller_errors, 3);
    assert_eq!(snap.stats.failed, 0);
    assert_eq!(snap.consecutive_failures, 0);
    assert_eq!(provider.calls(), 4);
}

#[tokio::test]
async fn non_streaming_provider_is_refused() {
    let provider = Scripted::replying(&["hi"]);
    let mut descriptor = ProviderDescriptor::new("batch", ProviderKind::OpenAI);
    descriptor.capabilities.streaming = false;
    let (app, state) = gateway_with(vec![(descriptor, provider.clone())], production(10, 5));

    let response = app.oneshot(post("/v1/chat", chat_body("batch"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("does not support streaming"));
    assert_eq!(provider.calls(), 0);
    assert_eq!(state.middleware.status().in_flight, 0);
}

// ============================================================================
// Cancellation and shutdown
// ============================================================================

/// Wait until every admitted call has finished its work.
async fn settled(state: &AppState) {
    for _ in 0..200 {
        if state.middleware.status().streams == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("calls still running: {:?}", state.middleware.status());
}

/// Read the first SSE frame, then hang up.
async fn read_first_frame_and_disconnect(response: axum::response::Response) -> String {
    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let data = frame.into_data().unwrap();
    String::from_utf8(data.to_vec()).unwrap()
}

#[tokio::test]
async fn caller_disconnect_cancels_the_call() {
    let provider = Scripted::hanging("partial");
    let (app, state) = gateway(vec![("mock", provider.clone())], production(10, 1));

    let response = app.clone().oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.middleware.status().streams, 1);

    let first = read_first_frame_and_disconnect(response).await;
    assert!(first.contains("partial"), "{first}");
    settled(&state).await;

    let status = state.middleware.status();
    assert_eq!(status.in_flight, 0);
    let snap = &status.providers[0];
    assert_eq!(snap.stats.cancelled, 1);
    assert_eq!(snap.stats.failed, 0);
    assert_eq!(snap.circuit, CircuitStatus::Closed);

    // Threshold of one, yet the next call goes through
    let response = app.oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn stop_drains_finishing_streams_and_forces_the_rest() {
    let hanging = Scripted::hanging("x");
    let finishing = Scripted::paced(&["a", "b"], Duration::from_millis(200));
    let mut settings = production(10, 5);
    settings.shutdown_grace_seconds = 1;
    let (app, state) = gateway(
        vec![("slow", hanging.clone()), ("quick", finishing.clone())],
        settings,
    );

    let mut responses = Vec::new();
    for name in ["slow", "quick", "slow"] {
        let response = app.clone().oneshot(post("/v1/chat", chat_body(name))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        responses.push(response);
    }
    assert_eq!(state.middleware.status().streams, 3);

    let stopper = tokio::spawn({
        let middleware = Arc::clone(&state.middleware);
        async move { middleware.stop().await }
    });

    let mut bodies = Vec::new();
    for response in responses {
        bodies.push(sse_events(response).await);
    }
    let report = stopper.await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.forced, 2);

    for forced in [&bodies[0], &bodies[2]] {
        assert_eq!(forced.len(), 2, "{forced:?}");
        assert_eq!(forced[0]["content"], "x");
        assert_eq!(forced[1], json!({"error": "gateway shutting down", "done": true}));
    }
    let drained = &bodies[1];
    assert_eq!(drained.len(), 3, "{drained:?}");
    assert_eq!(drained[2]["done"], true);
    assert!(drained[2]["usage"]["tokens"].as_u64().unwrap() > 0);

    let status = state.middleware.status();
    assert_eq!(status.streams, 0);
    assert_eq!(status.in_flight, 0);
    let slow = status.providers.iter().find(|p| p.name == "slow").unwrap();
    assert_eq!(slow.stats.cancelled, 2);
    let quick = status.providers.iter().find(|p| p.name == "quick").unwrap();
    assert_eq!(quick.stats.completed, 1);
}

#[tokio::test(start_paused = true)]
async fn abandoned_trial_call_frees_the_half_open_slot() {
    let provider = Scripted::hanging("hi");
    provider.unhealthy.store(true, Ordering::SeqCst);
    let (app, state) = gateway(vec![("mock", provider.clone())], production(10, 1));

    let response = app.clone().oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.middleware.status().providers[0].circuit, CircuitStatus::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    provider.unhealthy.store(false, Ordering::SeqCst);

    // The single trial call is admitted, then the caller hangs up
    let response = app.clone().oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    read_first_frame_and_disconnect(response).await;
    settled(&state).await;

    let body = body_json(app.clone().oneshot(get("/v1/status")).await.unwrap()).await;
    let snap = &body["production_features"]["providers"][0];
    assert_eq!(snap["circuit"], "half_open");
    assert_eq!(snap["cancelled"], 1);

    let response = app.oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(provider.calls(), 2);
}

// ============================================================================
// Server surface
// ============================================================================

#[tokio::test]
async fn cors_preflight_is_answered_without_body() {
    let (app, _) = gateway(vec![("mock", Scripted::replying(&["hi"]))], production(10, 5));

    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/v1/chat")
        .header(header::ORIGIN, "https://app.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type,x-external-api-key")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(preflight).await.unwrap();

    assert!(response.status().is_success());
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
    assert!(body_text(response).await.is_empty());
}

#[tokio::test]
async fn health_endpoints() {
    let (app, _) = gateway(vec![], production(10, 5));

    let body = body_json(app.clone().oneshot(get("/healthz")).await.unwrap()).await;
    assert_eq!(body, json!({"status": "healthy", "service": "relaygate"}));

    let response = app.clone().oneshot(get("/livez")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(app.oneshot(get("/version")).await.unwrap()).await;
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn providers_are_listed_in_registration_order() {
    let (app, _) = gateway(
        vec![
            ("zeta", Scripted::replying(&["a"])),
            ("alpha", Scripted::replying(&["b"])),
        ],
        production(10, 5),
    );

    let body = body_json(app.oneshot(get("/v1/providers")).await.unwrap()).await;
    assert_eq!(body["providers"], json!(["zeta", "alpha"]));
    assert_eq!(body["config"]["alpha"]["type"], "openai");
    assert_eq!(body["config"]["alpha"]["server_key"], false);
}

#[tokio::test]
async fn status_reports_usage_totals() {
    let (app, _) = gateway(vec![("mock", Scripted::replying(&["hi"]))], production(10, 5));

    let response = app.clone().oneshot(post("/v1/chat", chat_body("mock"))).await.unwrap();
    sse_events(response).await;

    let body = body_json(app.oneshot(get("/v1/status")).await.unwrap()).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["providers"], json!(["mock"]));
    let features = &body["production_features"];
    assert_eq!(features["rate_limit"]["requests_per_window"], 10);
    assert_eq!(features["providers"][0]["name"], "mock");
    assert_eq!(features["providers"][0]["completed"], 1);
    assert_eq!(features["providers"][0]["total_tokens"], 12);
    assert_eq!(features["providers"][0]["circuit"], "closed");
}

// ============================================================================
// Advise
// ============================================================================

#[tokio::test]
async fn advise_requires_a_known_mode() {
    let provider = Scripted::replying(&["{}"]);
    let (app, _) = gateway(vec![("mock", provider.clone())], production(10, 5));
    let body = json!({"provider": "mock", "model": "m", "scorecard": {"chi": 70}});

    for uri in ["/v1/advise", "/v1/advise?mode=sales"] {
        let response = app.clone().oneshot(post(uri, body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        let error = body_json(response).await;
        assert!(error["error"].as_str().unwrap().contains("exec|code|ops|community"));
    }
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn advise_streams_with_mode_prompt() {
    let provider = Scripted::replying(&["{\"summary\":{}}"]);
    let (app, _) = gateway(vec![("mock", provider.clone())], production(10, 5));
    let body = json!({
        "provider": "mock",
        "model": "m",
        "scorecard": {"chi": 70},
        "hotspots": ["src/lib.rs"]
    });

    let response = app.oneshot(post("/v1/advise?mode=code", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_events(response).await;
    assert_eq!(events.last().unwrap()["done"], true);

    let messages = provider.last_messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::System);
    assert!(messages[0].content.contains("code-quality"));
    assert!(messages[1].content.contains("src/lib.rs"));
}
