//! Gateway HTTP server

use axum::{Router, routing::get};
use rungate::{RedisSchemaStore, SchemaStore, shutdown_signal};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::executor::Executor;
use crate::handlers::{self, AppState};
use crate::runtime::Runtime;
use crate::{Config, ServiceError};

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sdl", get(handlers::sdl))
        .route(
            "/graphql",
            get(handlers::graphql_get).post(handlers::graphql_post),
        )
        .with_state(state)
}

pub async fn run(config: Config) -> Result<(), ServiceError> {
    tracing::info!("Connecting to Redis at {}", config.redis_url);
    let store: Arc<dyn SchemaStore> = Arc::new(RedisSchemaStore::connect(&config.redis_url).await?);
    tracing::info!("Connected to Redis");

    let runtime = Arc::new(Runtime::new(
        &config.gateway,
        store,
        config.reload_retry.clone(),
    ));
    let reloader = tokio::spawn(runtime.clone().run());

    let state = Arc::new(AppState {
        runtime,
        executor: Executor::new(config.downstream_timeout),
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("rungate gateway {} listening on {}", config.gateway, addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    tokio::select! {
        served = server => served?,
        reloaded = reloader => match reloaded {
            Ok(Err(e)) => {
                tracing::error!("Gateway {} could not load its schema: {}", config.gateway, e);
                return Err(ServiceError::Reload(e));
            }
            Ok(Ok(())) => {}
            Err(e) => tracing::error!("Reload task aborted: {}", e),
        },
    }

    Ok(())
}
