//! rungate broker - schema registry for federated GraphQL gateways
//!
//! Leaf services announce `(name, url, hash)` here. The broker introspects
//! them, checks the incoming schema against the gateway's live graph and then
//! either swaps it in immediately or, for breaking changes, parks it until
//! every instance of the version it replaces has drained.
//!
//! # State
//!
//! All state lives in the shared store (see [`rungate::keys`]). The broker
//! keeps only a disposable projection of each gateway's service list for
//! `GET /schemas/:gateway`, invalidated by store change notifications.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod handlers;
pub mod introspect;
pub mod projection;
pub mod registry;
pub mod server;

use std::time::Duration;

use rungate::RetryPolicy;
use thiserror::Error;

pub use introspect::{HttpIntrospector, IntrospectionError, Introspector};
pub use projection::Projection;
pub use registry::{Registry, RegistryError};
pub use server::{create_router, run};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Store error: {0}")]
    Store(#[from] rungate::StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub port: u16,
    /// Lease length of the per-gateway mutation lock
    pub lock_ttl: Duration,
    pub lock_retry: RetryPolicy,
    pub introspection_timeout: Duration,
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

        let port = parse_var("BROKER_PORT", 3001)?;
        let lock_ttl = Duration::from_millis(parse_var("LOCK_TTL_MS", 10_000)?);
        let lock_retry = RetryPolicy::new(
            Duration::from_millis(parse_var("LOCK_RETRY_BASE_MS", 50)?),
            Duration::from_millis(parse_var("LOCK_RETRY_MAX_MS", 1_000)?),
            Some(parse_var("LOCK_RETRY_ATTEMPTS", 5)?),
        );
        let introspection_timeout =
            Duration::from_secs(parse_var("INTROSPECTION_TIMEOUT_SECS", 10)?);

        Ok(Self {
            redis_url,
            port,
            lock_ttl,
            lock_retry,
            introspection_timeout,
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
