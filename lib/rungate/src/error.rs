//! rungate error types

use thiserror::Error;

/// Failures of the shared key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock not acquired: {0}")]
    LockNotAcquired(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the schema toolkit (parsing, merging, introspection decoding).
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid SDL for {service}: {message}")]
    Parse { service: String, message: String },

    #[error("Type {type_name} is defined as {existing} and as {incoming}")]
    TypeConflict {
        type_name: String,
        existing: String,
        incoming: String,
    },

    #[error("Field {type_name}.{field} has conflicting types {existing} and {incoming}")]
    FieldConflict {
        type_name: String,
        field: String,
        existing: String,
        incoming: String,
    },

    #[error("Invalid introspection result: {0}")]
    Introspection(String),
}

/// Failures of the broker client used by leaf services.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Broker returned error: {status} - {message}")]
    Broker { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
