use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use uuid::Uuid;

use super::routes::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub item: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub sequence: u64,
    pub item: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub redis: bool,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis_healthy = match &state.redis_client {
        Some(client) => match client.get_multiplexed_async_connection().await {
            Ok(mut con) => redis::cmd("PING")
                .query_async::<_, ()>(&mut con)
                .await
                .is_ok(),
            Err(_) => false,
        },
        None => false,
    };

    Json(HealthResponse {
        status: if redis_healthy { "healthy".to_string() } else { "degraded".to_string() },
        version: env!("CARGO_PKG_VERSION").to_string(),
        redis: redis_healthy,
    })
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics not enabled".to_string()),
    }
}

/// Creates an order. Every call that reaches this handler is a new side effect.
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> impl IntoResponse {
    let sequence = state.orders_created.fetch_add(1, Ordering::SeqCst) + 1;
    let order = OrderResponse {
        id: Uuid::new_v4(),
        sequence,
        item: request.item,
        quantity: request.quantity,
    };
    tracing::info!("Created order {} (#{})", order.id, order.sequence);

    let mut headers = HeaderMap::new();
    if let Ok(location) = HeaderValue::from_str(&format!("/orders/{}", order.id)) {
        headers.insert(header::LOCATION, location);
    }

    (StatusCode::CREATED, headers, Json(order))
}
