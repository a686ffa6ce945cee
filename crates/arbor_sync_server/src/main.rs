use arbor_core::crdt::ReplicaRegistry;
use arbor_sync_server::{
    auth::StaticTokenAuth,
    config::Config,
    handlers::ws_handler,
    handlers::ws::WsState,
    store::FileStore,
};
use axum::{
    Router,
    http::{Method, header},
    routing::get,
};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbor_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Arbor Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", config.data_dir);
    info!("CORS origins: {:?}", config.cors_origins);

    if config.tokens.is_empty() {
        error!("No access tokens configured; set ARBOR_TOKENS");
        std::process::exit(1);
    }

    // Initialize storage
    let store = match FileStore::new(&config.data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to initialize data directory: {}", e);
            std::process::exit(1);
        }
    };

    // Create shared state
    let registry = ReplicaRegistry::new(store, config.close_grace);
    let ws_state = WsState {
        auth: Arc::new(StaticTokenAuth::new(&config.tokens)),
        registry: registry.clone(),
        next_conn: Arc::new(AtomicU64::new(1)),
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(Any); // In production, use specific origins from config

    // Build the router
    let app = Router::new()
        .route("/", get(|| async { "Arbor Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        // WebSocket sync endpoint
        .route("/sync", get(ws_handler).with_state(ws_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    // Flush every open replica before exiting
    registry.save_all().await;

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
