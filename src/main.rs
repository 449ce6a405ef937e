use idempotency_layer::api::{create_router, AppState};
use idempotency_layer::config::Settings;
use idempotency_layer::idempotency::{Idempotency, RedisRecordStore};
use idempotency_layer::observability::{init_logging, init_metrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    init_logging(&settings.application.log_config());
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    // Connect to Redis
    info!("Connecting to Redis at {}...", settings.redis.url);
    let client = redis::Client::open(settings.redis.url.as_str())?;
    let mut con = client.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("PING").query_async(&mut con).await?;
    info!("Redis connection established");

    let store = Arc::new(RedisRecordStore::new(client.clone()));
    let idempotency = Idempotency::new(store, &settings.idempotency)?;
    info!(
        "Idempotency enabled for {:?} (lookup `{}`)",
        idempotency.methods(),
        settings.idempotency.key_lookup
    );

    let state = AppState::new(Some(client)).with_metrics(metrics_handle);
    let app = create_router(state, idempotency);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.application.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
