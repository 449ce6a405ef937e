use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::idempotency::{idempotency_middleware, Idempotency};
use crate::observability::{get_metrics, LatencyTimer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub redis_client: Option<redis::Client>,
    pub metrics_handle: Option<PrometheusHandle>,
    /// Number of orders actually created; replays never increment it.
    pub orders_created: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(redis_client: Option<redis::Client>) -> Self {
        Self {
            redis_client,
            metrics_handle: None,
            orders_created: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

async fn track_http_metrics(request: Request, next: Next) -> Response {
    let timer = LatencyTimer::new();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;
    get_metrics().record_http_request(&method, &path, response.status().as_u16(), timer.elapsed_ms());
    response
}

/// Creates the main API router. Side-effecting routes sit behind the
/// idempotency middleware; health and metrics do not.
pub fn create_router(state: AppState, idempotency: Idempotency) -> Router {
    let guarded = Router::new()
        .route("/orders", post(handlers::create_order))
        .route_layer(middleware::from_fn_with_state(idempotency, idempotency_middleware));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .merge(guarded)
        .layer(middleware::from_fn(track_http_metrics))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
