mod config;
mod db;
mod errors;
mod handlers;
mod interest;
mod loan_store;
mod models;
mod reconcile;
mod sheet;
mod storage;
mod storage_webhook;

use axum::{
    routing::{get, post},
    Router,
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::storage::FileStore;

/// Main entry point for the application.
///
/// Initializes logging, configuration, the database pool (running
/// migrations), the upload store, and the HTTP routes with their middleware
/// (CORS, rate limiting, request size limit), then starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coopcredit_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize database connection pool and apply migrations
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    // Upload store + spreadsheet download client
    let store = FileStore::new(&config)?;
    tracing::info!("Upload store ready at {}", config.upload_dir);

    // In-flight import guard. 10 minute TTL comfortably covers one file's
    // processing time; the durable processed flag guards across restarts.
    let in_flight_imports = Cache::builder()
        .time_to_live(Duration::from_secs(600))
        .max_capacity(1_000)
        .build();
    tracing::info!("In-flight import guard initialized");

    // Build application state
    let app_state = Arc::new(handlers::AppState {
        db: db.pool.clone(),
        config: config.clone(),
        store,
        in_flight_imports,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        // Spreadsheet upload + batch history
        .route("/api/v1/imports", post(handlers::upload_repayment_sheet))
        .route("/api/v1/imports", get(handlers::list_import_batches))
        // Storage-finalize trigger for the reconciliation pipeline
        .route(
            "/api/v1/webhooks/storage",
            post(storage_webhook::storage_finalized),
        )
        // Loan application intake
        .route("/api/v1/loans/apply", post(handlers::apply_for_loan))
        // Admin loan lifecycle
        .route("/api/v1/loans", get(handlers::list_loans))
        .route(
            "/api/v1/loans/:id/status",
            post(handlers::change_loan_status),
        )
        .route("/api/v1/borrowers/:id", get(handlers::get_borrower))
        // Repayment calculator
        .route("/api/v1/calculator", get(handlers::calculate_repayment))
        // Reports
        .route(
            "/api/v1/reports/portfolio",
            get(handlers::portfolio_report),
        )
        .layer(
            ServiceBuilder::new()
                // Request size limit: 20MB max payload (covers monthly spreadsheets)
                .layer(RequestBodyLimitLayer::new(20 * 1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Build final app with health check (bypasses rate limiting)
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
