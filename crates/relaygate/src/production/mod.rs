//! Production middleware: admission control, circuit breaking, usage
//! accounting and lifecycle for provider calls.
//!
//! A call goes through [`ProductionMiddleware::admit`] first. The returned
//! [`Admission`] is then handed to [`ProductionMiddleware::chat`], which opens
//! the provider stream and forwards it through a bounded queue from a spawned
//! task. The admission settles exactly once: success on a done chunk, failure
//! on an error chunk, a neutral outcome on a caller error, and cancellation
//! otherwise.
//!
//! Every admission holds a [`TaskTracker`] token from `admit` until its call
//! ends, so [`ProductionMiddleware::stop`] also waits for calls that are still
//! in their pre-flight phase.

mod circuit;
mod rate_limit;
mod state;

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{OnceCell, mpsc};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, info, warn};

pub use circuit::{CircuitStatus, Permit};
pub use state::{ProviderSnapshot, ProviderStats};

use self::circuit::CircuitRejection;
use self::state::{ProviderState, Rejection};
use crate::config::{CircuitBreakerSettings, ProductionSettings, RateLimitSettings};
use crate::error::GatewayError;
use crate::llm::{ChatChunk, ChatRequest, ChatStream, LLMError, LLMProvider, Usage};

/// Message of the failure event sent to streams closed by shutdown.
pub const SHUTDOWN_MESSAGE: &str = "gateway shutting down";
pub const IDLE_TIMEOUT_MESSAGE: &str = "stream idle timeout";
const EARLY_END_MESSAGE: &str = "upstream stream ended without a terminal event";

// ============================================================================
// ProductionConfig
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProductionConfig {
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub shutdown_grace: Duration,
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self::from(&ProductionSettings::default())
    }
}

impl From<&ProductionSettings> for ProductionConfig {
    fn from(settings: &ProductionSettings) -> Self {
        Self {
            rate_limit: settings.rate_limit.clone(),
            circuit_breaker: settings.circuit_breaker.clone(),
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_seconds),
            queue_capacity: settings.stream_queue_capacity.max(1),
            idle_timeout: Duration::from_secs(settings.stream_idle_timeout_seconds),
        }
    }
}

// ============================================================================
// ProductionMiddleware
// ============================================================================

pub struct ProductionMiddleware {
    config: ProductionConfig,
    providers: DashMap<String, Arc<ProviderState>>,
    /// Registration order, for status listings.
    order: Mutex<Vec<Arc<ProviderState>>>,
    /// Counts admitted calls until they end.
    tracker: TaskTracker,
    /// Cancelled when `stop` begins. No admissions after that.
    stopping: CancellationToken,
    /// Cancelled when `stop` finishes waiting. Parent of every call token.
    terminate: CancellationToken,
    stop_report: OnceCell<StopReport>,
}

impl ProductionMiddleware {
    pub fn new(config: ProductionConfig) -> Self {
        Self {
            config,
            providers: DashMap::new(),
            order: Mutex::new(Vec::new()),
            tracker: TaskTracker::new(),
            stopping: CancellationToken::new(),
            terminate: CancellationToken::new(),
            stop_report: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ProductionConfig {
        &self.config
    }

    /// Create governance state for `name` with the default budget. Idempotent.
    pub fn register_provider(&self, name: &str) {
        self.register_provider_with(name, self.config.rate_limit.clone());
    }

    /// Create governance state for `name` with its own admission budget.
    /// Idempotent: an existing registration is kept unchanged.
    pub fn register_provider_with(&self, name: &str, rate_limit: RateLimitSettings) {
        if let Entry::Vacant(entry) = self.providers.entry(name.to_string()) {
            let state = Arc::new(ProviderState::new(
                name,
                &rate_limit,
                &self.config.circuit_breaker,
            ));
            self.order
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&state));
            entry.insert(state);
            debug!(
                provider = %name,
                requests_per_window = rate_limit.requests_per_window,
                window_seconds = rate_limit.window_seconds,
                "Registered provider with middleware"
            );
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    /// Admission control for one call to `provider`.
    pub fn admit(&self, provider: &str) -> Result<Admission, GatewayError> {
        if self.is_stopping() {
            return Err(GatewayError::unavailable("gateway is shutting down"));
        }
        let state = self
            .providers
            .get(provider)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| GatewayError::NotFound(provider.to_string()))?;

        match state.try_admit(Instant::now()) {
            Ok(permit) => {
                if permit == Permit::Probe {
                    info!(provider = %provider, "Circuit half-open, admitting probe call");
                }
                Ok(Admission {
                    state,
                    permit,
                    started: Instant::now(),
                    settled: false,
                    cancel: self.terminate.child_token(),
                    _tracked: self.tracker.token(),
                })
            }
            Err(Rejection::RateLimited(retry_after)) => {
                debug!(
                    provider = %provider,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limited"
                );
                Err(GatewayError::RateLimited {
                    provider: provider.to_string(),
                    retry_after,
                })
            }
            Err(Rejection::Circuit(CircuitRejection::Open(remaining))) => {
                Err(GatewayError::unavailable(format!(
                    "provider '{}' circuit is open (retry in {}s)",
                    provider,
                    remaining.as_secs().max(1)
                )))
            }
            Err(Rejection::Circuit(CircuitRejection::ProbeInFlight)) => {
                Err(GatewayError::unavailable(format!(
                    "provider '{}' circuit is half-open and probing",
                    provider
                )))
            }
        }
    }

    /// Open the provider stream for an admitted call and forward it through a
    /// bounded queue.
    ///
    /// Setup failures the caller caused (missing or rejected key, unknown
    /// model) are a [`GatewayError::Validation`] and do not count against the
    /// provider. Other setup failures settle the admission as a failure and
    /// return [`GatewayError::Upstream`]. Dropping the returned handle cancels
    /// the call.
    pub async fn chat(
        &self,
        mut admission: Admission,
        provider: Arc<dyn LLMProvider>,
        request: ChatRequest,
    ) -> Result<ChatHandle, GatewayError> {
        if admission.cancel.is_cancelled() {
            return Err(GatewayError::unavailable("gateway is shutting down"));
        }

        let cancel = admission.cancel.clone();
        let stream = match provider.chat(request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(LLMError::Cancelled) => {
                return Err(GatewayError::unavailable("gateway is shutting down"));
            }
            Err(e) if e.is_caller_error() => {
                admission.reject(&e.to_string());
                return Err(GatewayError::validation(e.to_string()));
            }
            Err(e) => {
                admission.fail(&e.to_string());
                return Err(GatewayError::Upstream(e));
            }
        };

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        // The admission carries the tracker token, so the task is counted until it returns
        tokio::spawn(forward(
            stream,
            tx,
            admission,
            self.terminate.clone(),
            self.config.idle_timeout,
        ));

        Ok(ChatHandle {
            rx,
            shutdown: false,
            _cancel_on_drop: cancel.drop_guard(),
        })
    }

    /// Snapshot of every provider's state, in registration order.
    pub fn status(&self) -> ProductionStatus {
        let states = self
            .order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let now = Instant::now();
        let providers: Vec<_> = states.iter().map(|s| s.snapshot(now)).collect();

        ProductionStatus {
            stopping: self.is_stopping(),
            in_flight: providers.iter().map(|p| p.in_flight).sum(),
            streams: self.tracker.len(),
            rate_limit: self.config.rate_limit.clone(),
            circuit_breaker: self.config.circuit_breaker.clone(),
            providers,
        }
    }

    /// Stop admitting calls, let admitted calls finish within the grace
    /// period, then force-close the rest. Calls admitted before `stop` that
    /// have not opened their stream by then are refused.
    ///
    /// Idempotent: later and concurrent calls wait for and return the first report.
    pub async fn stop(&self) -> StopReport {
        *self
            .stop_report
            .get_or_init(|| async move {
                self.stopping.cancel();
                self.tracker.close();

                let pending = self.tracker.len();
                info!(
                    in_flight = pending,
                    grace_seconds = self.config.shutdown_grace.as_secs(),
                    "Stopping production middleware"
                );

                let drained_in_time =
                    tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
                        .await
                        .is_ok();

                let forced = if drained_in_time {
                    self.terminate.cancel();
                    0
                } else {
                    let remaining = self.tracker.len();
                    warn!(streams = remaining, "Grace period elapsed, force-closing streams");
                    self.terminate.cancel();
                    self.tracker.wait().await;
                    remaining
                };

                let report = StopReport {
                    drained: pending.saturating_sub(forced),
                    forced,
                };
                info!(
                    drained = report.drained,
                    forced = report.forced,
                    "Production middleware stopped"
                );
                report
            })
            .await
    }
}

// ============================================================================
// Admission
// ============================================================================

/// An admitted call. Settles its provider state exactly once; dropping it
/// unsettled counts as a cancellation.
///
/// Counted by `stop` for as long as it lives.
pub struct Admission {
    state: Arc<ProviderState>,
    permit: Permit,
    started: Instant,
    settled: bool,
    /// Child of the terminate token; also the provider call's token.
    cancel: CancellationToken,
    _tracked: TaskTrackerToken,
}

impl Admission {
    pub fn provider(&self) -> &str {
        self.state.name()
    }

    /// Resolves once shutdown gives up on this call. Pre-flight work should
    /// stop waiting at that point.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn succeed(&mut self, usage: &Usage) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        self.state.record_success(self.permit, usage);
        info!(
            provider = %usage.provider,
            model = %usage.model,
            tokens = usage.tokens,
            ms = usage.ms,
            cost_usd = usage.cost_usd,
            "usage"
        );
    }

    pub fn fail(&mut self, error: &str) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        self.state
            .record_failure(self.permit, self.started.elapsed(), error);
        warn!(provider = %self.state.name(), error = %error, "Provider call failed");
    }

    /// Settle as refused because of the caller. Neither success nor failure.
    pub fn reject(&mut self, error: &str) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        self.state.record_caller_error(self.permit, error);
        debug!(provider = %self.state.name(), error = %error, "Provider refused the caller's request");
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("provider", &self.state.name())
            .field("permit", &self.permit)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            self.state.record_cancelled(self.permit);
        }
    }
}

// ============================================================================
// ChatHandle
// ============================================================================

/// Item of the hand-off queue.
#[derive(Debug)]
enum Forwarded {
    Chunk(ChatChunk),
    /// The call was force-closed by shutdown.
    Shutdown,
}

/// Receiving end of a forwarded provider stream.
///
/// Yields at most one terminal chunk. A stream force-closed by shutdown ends
/// with an error chunk carrying [`SHUTDOWN_MESSAGE`] and
/// [`closed_by_shutdown`](Self::closed_by_shutdown) turns true. Dropping the
/// handle cancels the provider call.
pub struct ChatHandle {
    rx: mpsc::Receiver<Forwarded>,
    shutdown: bool,
    _cancel_on_drop: DropGuard,
}

impl ChatHandle {
    pub async fn recv(&mut self) -> Option<ChatChunk> {
        self.next().await
    }

    /// Whether the last chunk yielded was the shutdown close.
    pub fn closed_by_shutdown(&self) -> bool {
        self.shutdown
    }
}

impl Stream for ChatHandle {
    type Item = ChatChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Forwarded::Chunk(chunk))) => Poll::Ready(Some(chunk)),
            Poll::Ready(Some(Forwarded::Shutdown)) => {
                self.shutdown = true;
                Poll::Ready(Some(ChatChunk::Error(SHUTDOWN_MESSAGE.to_string())))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Pump chunks from the provider into the queue until a terminal chunk,
/// cancellation, or a closed receiver.
async fn forward(
    mut stream: ChatStream,
    tx: mpsc::Sender<Forwarded>,
    mut admission: Admission,
    terminate: CancellationToken,
    idle_timeout: Duration,
) {
    let cancel = admission.cancel.clone();
    let mut cancelled = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };

        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => ChatChunk::Error(EARLY_END_MESSAGE.to_string()),
            Err(_) => ChatChunk::Error(IDLE_TIMEOUT_MESSAGE.to_string()),
        };
        match &chunk {
            ChatChunk::Delta(_) => {}
            ChatChunk::Done(usage) => admission.succeed(usage),
            ChatChunk::Error(message) => admission.fail(message),
        }
        let terminal = chunk.is_terminal();

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                false
            }
            sent = tx.send(Forwarded::Chunk(chunk)) => sent.is_ok(),
        };
        if !sent || terminal {
            break;
        }
    }

    // Best effort: the caller may be gone or the queue full
    if cancelled
        && terminate.is_cancelled()
        && tx
            .try_send(Forwarded::Shutdown)
            .is_ok()
    {
        debug!(provider = %admission.provider(), "Stream force-closed by shutdown");
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ProductionStatus {
    pub stopping: bool,
    /// Admitted calls that have not settled yet.
    pub in_flight: usize,
    /// Admitted calls whose work has not finished, including forwarding tasks.
    pub streams: usize,
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub providers: Vec<ProviderSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Streams that reached a terminal state within the grace period.
    pub drained: usize,
    /// Streams closed when the grace period ran out.
    pub forced: usize,
}

// ============================================================================
// Tests
// ============================================================================
