//! Broker HTTP server

use axum::{
    Router,
    routing::{get, post},
};
use rungate::{RedisSchemaStore, SchemaStore, shutdown_signal};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::handlers::{self, AppState};
use crate::introspect::HttpIntrospector;
use crate::projection::{Projection, projection_sync_subscriber};
use crate::registry::Registry;
use crate::{Config, ServiceError};

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/register", post(handlers::register))
        .route("/deregister", post(handlers::deregister))
        .route("/schemas/:gateway", get(handlers::get_schemas))
        .route(
            "/schemas/:gateway/triage/:hash",
            get(handlers::get_triage),
        )
        .with_state(state)
}

pub async fn run(config: Config) -> Result<(), ServiceError> {
    tracing::info!("Connecting to Redis at {}", config.redis_url);
    let store: Arc<dyn SchemaStore> = Arc::new(RedisSchemaStore::connect(&config.redis_url).await?);
    tracing::info!("Connected to Redis");

    let introspector = Arc::new(HttpIntrospector::new(config.introspection_timeout));
    let registry = Registry::new(store.clone(), introspector)
        .with_lock_policy(config.lock_ttl, config.lock_retry.clone());

    let projection = Arc::new(Projection::new(store.clone()));
    tokio::spawn(projection_sync_subscriber(store, projection.clone()));

    let state = Arc::new(AppState {
        registry,
        projection,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("rungate broker listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
