//! rungate gateway - federating GraphQL gateway

use rungate_gateway::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rungate_gateway=debug,rungate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting rungate gateway");

    let config = Config::from_env()?;
    rungate_gateway::run(config).await?;

    Ok(())
}
