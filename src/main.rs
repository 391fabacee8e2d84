// =============================================================================
// BOUTIQUE SERVICE - Main Entry Point
// =============================================================================
// Backend of the boutique storefront.
//
// WHAT THIS SERVICE DOES:
// - Places orders, reserving product stock inside one database transaction
// - Cancels orders (stock restored) and moves them through their statuses
// - Runs PVit mobile-money payments: sends the request, then holds the HTTP
//   call open until the provider's webhook reports the outcome
// - Exposes Prometheus metrics and caches order reads in Redis
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod callbacks; // Reference → waiting payment request (callbacks.rs)
mod config; // Configuration loading (config.rs)
mod db; // Pool, schema and seed data (db.rs)
mod error; // Error types (error.rs)
mod gateway; // Payment flows and webhook reconciliation (gateway.rs)
mod handlers; // HTTP request handlers (handlers.rs)
mod inventory; // Row-locked stock reservation (inventory.rs)
mod metrics; // Prometheus metrics setup (metrics.rs)
mod models; // Data structures (models.rs)
mod orders; // Order transactions (orders.rs)
mod provider; // PVit HTTP client (provider.rs)
mod secret; // Provider secret key cache (secret.rs)
mod store; // Payment transaction records (store.rs)

#[cfg(test)]
mod test_support;

// -----------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::gateway::PaymentGateway;
use crate::metrics::setup_metrics;
use crate::orders::OrderManager;
use crate::store::PgTransactionStore;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by every request handler through State<Arc<AppState>>.
//
// LEARNING NOTE:
// The payment gateway holds process-wide mutable state (secret key, waiting
// requests). It is built once here and shared behind an Arc, never a global,
// so tests can build their own instance.
#[derive(Clone)]
pub struct AppState {
    // Database connection pool (health checks)
    pub db: Database,

    // Order placement / cancellation / status updates
    pub orders: OrderManager,

    // PVit payment flows and webhook reconciliation
    pub gateway: Arc<PaymentGateway>,

    // Redis connection for caching order reads
    pub redis: redis::aio::ConnectionManager,

    // Renders metrics in Prometheus format
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok(); // the .env file is optional

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // Structured JSON logs; RUST_LOG controls levels
    // Example: RUST_LOG=info,boutique_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,boutique_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Boutique Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        callback_timeout_secs = config.provider.callback_timeout.as_secs(),
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL database
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis
    // -------------------------------------------------------------------------
    // ConnectionManager handles reconnection automatically
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    // -------------------------------------------------------------------------
    // STEP 7: Build the domain services
    // -------------------------------------------------------------------------
    let orders = OrderManager::new(db.pool());
    let store = Arc::new(PgTransactionStore::new(db.pool()));
    let gateway = Arc::new(PaymentGateway::new(config.provider.clone(), store)?);

    // Keeps the provider secret key fresh in the background
    let _secret_refresh = gateway.spawn_secret_refresh();

    let state = Arc::new(AppState {
        db,
        orders,
        gateway,
        redis: redis_conn,
        metrics_handle,
    });

    // -------------------------------------------------------------------------
    // STEP 8: Define routes
    // -------------------------------------------------------------------------
    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Order Endpoints -----
        .route(
            "/commandes",
            get(handlers::list_orders).post(handlers::create_order),
        )
        .route(
            "/commandes/:id",
            get(handlers::get_order)
                .put(handlers::update_order_status)
                .delete(handlers::delete_order),
        )
        // ----- Payment Endpoints -----
        .route("/api/rest-transaction", post(handlers::rest_transaction))
        .route("/api/payment/generate-link", post(handlers::generate_payment_link))
        .route("/api/payment-webhook", post(handlers::payment_webhook))
        .route("/api/payment/secret-callback", post(handlers::secret_callback))
        .route("/api/transactions/:reference", get(handlers::get_transaction))
        // ----- Middleware Layers -----
        // The storefront calls this API from the browser
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // Log every request
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Boutique Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
