use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_server::broker::memory::MemoryBroker;
use chat_server::broker::redis_broker::RedisBroker;
use chat_server::broker::Broker;
use chat_server::config::Config;
use chat_server::hub::Hub;
use chat_server::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let broker: Arc<dyn Broker> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisBroker::connect(url)
                .await
                .expect("failed to connect to redis"),
        ),
        None => {
            tracing::warn!("REDIS_URL not set, using the in-memory broker (single node only)");
            Arc::new(MemoryBroker::new())
        }
    };

    let hub = Hub::new(broker, config.hub_settings());
    hub.start().await.expect("failed to start hub");

    let metrics = match chat_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(?err, "metrics recorder not installed");
            None
        }
    };

    tracing::info!(server_id = %hub.server_id(), "chat-server configured");

    let state = AppState {
        hub: hub.clone(),
        config: Arc::new(config),
        metrics,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(chat_server::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "chat-server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    hub.cleanup().await;
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
