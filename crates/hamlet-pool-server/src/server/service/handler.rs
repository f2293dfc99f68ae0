//! Routes of the dispatch front.
//!
//! - `POST /api/{endpoint}`: run the JSON body on an isolated instance of
//!   `endpoint` and answer with the handler's JSON response.
//! - `GET /health`: `200` while serving, `503` once shutdown has begun.
//! - `GET /pool/status`: per-endpoint occupancy and pool-wide counters.

use crate::server::{
    handlers::BuiltinFactory,
    service::error::ApiError,
    telemetry::{
        decrement_requests_inflight, increment_request_errors, increment_requests,
        increment_requests_inflight, record_request_duration,
    },
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use hamlet_pool::{HandlerPool, Payload, RequestContext};
use serde_json::json;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

pub type Pool = HandlerPool<BuiltinFactory>;

#[derive(Clone)]
pub struct AppState {
    pool: Pool,
    inflight: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Counts one request as in flight until dropped, including when axum drops
/// the handler future because the client went away.
struct InFlight<'a> {
    endpoint: &'a str,
    count: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(endpoint: &'a str, count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        increment_requests_inflight(endpoint);
        Self { endpoint, count }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
        decrement_requests_inflight(self.endpoint);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/{endpoint}", post(dispatch))
        .route("/health", get(health))
        .route("/pool/status", get(pool_status))
        .with_state(state)
}

/// Builds the per-request context from `x-request-id`, `host`, `x-user-id`
/// and `x-session-id`, generating a request id when none was sent.
pub fn request_context(headers: &HeaderMap) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let request_id = header("x-request-id").map_or_else(
        || format!("{:016x}", rand::random::<u64>()),
        str::to_string,
    );
    let mut context = RequestContext::new(request_id);
    if let Some(host) = header("host") {
        context = context.with_host(host);
    }
    if let Some(user) = header("x-user-id") {
        context = context.with_user(user);
    }
    if let Some(session) = header("x-session-id") {
        context = context.with_session(session);
    }
    context
}

async fn dispatch(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Payload>,
) -> Result<Json<Payload>, ApiError> {
    let start = std::time::Instant::now();
    let context = request_context(&headers);

    increment_requests(&endpoint);
    let inflight = InFlight::enter(&endpoint, &state.inflight);

    let fut = state.pool.submit(&endpoint, body, context.clone());
    #[cfg(feature = "tracing")]
    let fut = {
        use tracing::Instrument;
        let span = tracing::info_span!(
            "dispatch",
            endpoint = %endpoint,
            request_id = %context.request_id,
        );
        fut.instrument(span)
    };
    let result = fut.await;

    drop(inflight);
    record_request_duration(&endpoint, start.elapsed().as_millis() as f64);

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            let err = ApiError::from(e);
            increment_request_errors(&endpoint, err.kind_label());
            #[cfg(feature = "tracing")]
            tracing::warn!(
                endpoint = %endpoint,
                request_id = %context.request_id,
                code = err.code(),
                "Request failed: {}",
                err.0
            );
            Err(err)
        }
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.pool.is_closed() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting_down" })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "status": "serving" })))
    }
}

async fn pool_status(State(state): State<AppState>) -> Json<Payload> {
    let metrics = state.pool.metrics();
    Json(json!({
        "inflight": state.inflight.load(Ordering::Relaxed),
        "endpoints": state.pool.statuses(),
        "metrics": metrics,
        "success_rate": metrics.success_rate(),
    }))
}
