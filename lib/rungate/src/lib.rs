//! rungate - shared plumbing for the schema broker and the federating gateway
//!
//! This library provides the store adapter, key layout, schema toolkit
//! (introspection, merging, compatibility checking) and the broker client
//! used by leaf services to announce themselves.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

#[cfg(feature = "server")]
pub mod server;

pub mod client;
pub mod error;
pub mod keys;
pub mod retry;
pub mod schema;
pub mod store;
pub mod types;

#[cfg(feature = "server")]
pub use server::shutdown_signal;

#[cfg(feature = "redis")]
pub use store::RedisSchemaStore;

pub use client::{Announcer, AnnouncerConfig, BrokerClient, git_revision};
pub use error::{ClientError, SchemaError, StoreError};
pub use retry::RetryPolicy;
pub use schema::{
    Change, ChangeKind, CompatibilityReport, Criticality, MergedSchema, OperationKind,
    check_compatibility, merge_schemas,
};
pub use store::{LockLease, MemoryStore, SchemaStore};
pub use types::{
    DeregisterRequest, DeregistrationOutcome, DeregistrationResponse, ErrorCode, ErrorResponse,
    RegisterRequest, RegistrationOutcome, RegistrationResponse, RegistrationStatus, ServiceEntry,
};
