#[cfg(feature = "server")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;

    use authengine::core::auth::{AuthApiState, AuthEngine, auth_api_router, health_handler};
    use authengine::core::config::Config;
    use authengine::core::db::{DbConfig, PgStore, create_pool, health_check};
    use axum::Router;
    use axum::routing::get;
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;
    use tracing_subscriber::EnvFilter;

    // Load .env file (if exists)
    let _ = dotenvy::dotenv();

    // Initialize tracing; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        "Config loaded: database={}, base_url={}, username={}",
        config.has_database(),
        config.base_url,
        config.username_enabled
    );

    let database_url = config
        .database_url
        .clone()
        .ok_or("DATABASE_URL environment variable is not set")?;
    let pool =
        create_pool(&DbConfig::new(database_url).max_connections(config.db_max_connections))
            .await?;
    health_check(&pool).await?;

    // The engine migrates the store and binds it to its table names
    let store = Arc::new(PgStore::new(pool));
    let engine = AuthEngine::new(store, config.auth_options()).await?;

    let app = Router::new()
        .route("/", get(health_handler))
        .merge(auth_api_router(AuthApiState { engine }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("listening on http://{}", config.bind_addr);
    tracing::info!("Auth API: http://{}/api/auth", config.bind_addr);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[cfg(not(feature = "server"))]
pub fn main() {
    // no server without the `server` feature
    // embed the library and call AuthEngine directly instead
}
