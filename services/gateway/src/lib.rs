//! rungate gateway - hot-reloading federation gateway
//!
//! Serves one logical gateway. The merged schema is built from the service
//! list the broker keeps in the store and rebuilt whenever the store reports
//! a write to that list. Requests are answered by delegating each root field
//! to the service that owns it.
//!
//! # Data Flow
//!
//! 1. Broker writes `schema:<gateway>`
//! 2. Store publishes the write, the runtime queues a rebuild
//! 3. Rebuild reads the list, merges schemas, swaps the live pointer
//! 4. Requests that start afterwards see the new schema

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod executor;
pub mod handlers;
pub mod runtime;
pub mod server;

use std::time::Duration;

use rungate::{RetryPolicy, keys};
use thiserror::Error;

pub use executor::{ExecutionError, Executor, GraphQlRequest, GraphQlResponse};
pub use runtime::{GatewaySchema, ReloadError, RemoteService, Runtime};
pub use server::{create_router, run};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Store error: {0}")]
    Store(#[from] rungate::StoreError),
    #[error("Reload error: {0}")]
    Reload(#[from] ReloadError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub port: u16,
    /// Logical gateway this process serves
    pub gateway: String,
    pub reload_retry: RetryPolicy,
    pub downstream_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ServiceError> {
        let redis_url = match std::env::var("REDIS_URL") {
            Ok(url) => url,
            Err(_) => {
                let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
                let port = std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                format!("redis://{}:{}", host, port)
            }
        };

        let port = parse_var("GATEWAY_PORT", 3002)?;

        let gateway = std::env::var("GATEWAY_NAME").unwrap_or_else(|_| "main".to_string());
        if !keys::is_valid_gateway(&gateway) {
            return Err(ServiceError::Config(format!(
                "GATEWAY_NAME {:?} is not a valid gateway name",
                gateway
            )));
        }

        let max_attempts = match std::env::var("RELOAD_MAX_ATTEMPTS") {
            Ok(_) => Some(parse_var("RELOAD_MAX_ATTEMPTS", 0)?),
            Err(_) => None,
        };
        let reload_retry = RetryPolicy::new(
            Duration::from_millis(parse_var("RELOAD_BACKOFF_MS", 5_000)?),
            Duration::from_millis(parse_var("RELOAD_BACKOFF_MAX_MS", 60_000)?),
            max_attempts,
        );

        let downstream_timeout = Duration::from_secs(parse_var("DOWNSTREAM_TIMEOUT_SECS", 30)?);

        Ok(Self {
            redis_url,
            port,
            gateway,
            reload_retry,
            downstream_timeout,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ServiceError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| ServiceError::Config(format!("{} must be a valid number: {}", name, e))),
        Err(_) => Ok(default),
    }
}
