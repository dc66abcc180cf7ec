//! Shared store adapter
//!
//! The store is the single source of truth for every gateway's active
//! registry, per-hash instance counters, triaged versions, and the lease lock
//! that serialises structural mutations. Keys follow [`crate::keys`].

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::{LoadHold, MemoryStore};
#[cfg(feature = "redis")]
pub use redis_store::RedisSchemaStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::{error::StoreError, types::ServiceEntry};

/// Proof of lock ownership. Only the holder of the token can release the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub gateway: String,
    pub token: String,
}

impl LockLease {
    pub fn new(gateway: &str) -> Self {
        Self {
            gateway: gateway.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Load a gateway's active registry. `None` when the gateway was never bootstrapped.
    async fn load_registry(&self, gateway: &str) -> Result<Option<Vec<ServiceEntry>>, StoreError>;

    /// Create the registry only if it does not exist yet. Returns whether it was created.
    async fn create_registry(
        &self,
        gateway: &str,
        services: &[ServiceEntry],
    ) -> Result<bool, StoreError>;

    /// Overwrite the registry. Every write produces a change notification.
    async fn save_registry(&self, gateway: &str, services: &[ServiceEntry])
    -> Result<(), StoreError>;

    async fn incr_instances(&self, gateway: &str, hash: &str) -> Result<i64, StoreError>;

    /// Atomically decrement, deleting the counter when it reaches zero.
    /// Returns the remaining count, never below zero.
    async fn decr_instances(&self, gateway: &str, hash: &str) -> Result<i64, StoreError>;

    /// Current count; a missing counter reads as zero.
    async fn instance_count(&self, gateway: &str, hash: &str) -> Result<i64, StoreError>;

    async fn delete_instances(&self, gateway: &str, hash: &str) -> Result<(), StoreError>;

    async fn put_triage(&self, gateway: &str, entry: &ServiceEntry) -> Result<(), StoreError>;

    async fn get_triage(&self, gateway: &str, hash: &str)
    -> Result<Option<ServiceEntry>, StoreError>;

    /// Fetch and delete a triage entry in one step.
    async fn take_triage(
        &self,
        gateway: &str,
        hash: &str,
    ) -> Result<Option<ServiceEntry>, StoreError>;

    async fn delete_triage(&self, gateway: &str, hash: &str) -> Result<(), StoreError>;

    async fn set_triage_pointer(
        &self,
        gateway: &str,
        parent_hash: &str,
        child_hash: &str,
    ) -> Result<(), StoreError>;

    async fn get_triage_pointer(
        &self,
        gateway: &str,
        parent_hash: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn delete_triage_pointer(&self, gateway: &str, parent_hash: &str)
    -> Result<(), StoreError>;

    /// Try to take the gateway's lease lock. Returns `false` if someone else holds it.
    async fn acquire_lock(&self, lease: &LockLease, ttl: Duration) -> Result<bool, StoreError>;

    /// Release the lock if `lease` still owns it. Returns whether it was released.
    async fn release_lock(&self, lease: &LockLease) -> Result<bool, StoreError>;

    /// Stream of gateway names whose active registry was written.
    async fn watch_registries(&self) -> Result<BoxStream<'static, String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leases_have_distinct_tokens() {
        let a = LockLease::new("main");
        let b = LockLease::new("main");
        assert_eq!(a.gateway, "main");
        assert_ne!(a.token, b.token);
    }
}
