use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::signal;

use identity_service::{build_router, config::IdentityConfig, AppState};
use identity_service::services::{Database, RedisChallengeStore};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    // Fail fast on bad configuration.
    let config = IdentityConfig::from_env()?;
    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Database connection failed: {e}")))?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Migration failed: {e}")))?;
    let db = Database::new(pool);
    tracing::info!("Database initialized");

    let redis_client = redis::Client::open(config.redis.url.clone())
        .map_err(AppError::CacheError)?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .map_err(AppError::CacheError)?;
    let challenges = Arc::new(RedisChallengeStore::new(redis_conn));
    tracing::info!("Challenge store initialized");

    let port = config.common.port;
    let state = AppState::build(config, db, challenges)?;
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Bind failed: {e}")))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| AppError::InternalError(anyhow::anyhow!("Server error: {e}")))?;

    tracing::info!("Shut down cleanly");
    Ok(())
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
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
