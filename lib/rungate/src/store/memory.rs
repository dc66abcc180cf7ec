//! In-process store with the same semantics as the redis adapter.
//!
//! Used by tests and single-process development setups. Registry writes are
//! announced on a broadcast channel, mirroring keyspace notifications.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast};

use super::{LockLease, SchemaStore};
use crate::{error::StoreError, keys, types::ServiceEntry};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct State {
    values: HashMap<String, String>,
    counters: HashMap<String, i64>,
    locks: HashMap<String, (String, Instant)>,
    unavailable: bool,
    held_load: Option<LoadHold>,
}

/// A registry load parked after its read, see [`MemoryStore::hold_next_load`].
#[derive(Clone, Default)]
pub struct LoadHold {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl LoadHold {
    /// Wait until a load has read the registry and parked.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the parked load return what it read.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    changes: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            changes,
        }
    }

    /// Make every subsequent operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Park the next `load_registry` once it has read, until the hold is released.
    /// Writes made meanwhile are invisible to that load.
    pub fn hold_next_load(&self) -> LoadHold {
        let hold = LoadHold::default();
        self.state().held_load = Some(hold.clone());
        hold
    }

    /// Snapshot of all live keys, sorted. Counters and locks included.
    pub fn keys(&self) -> Vec<String> {
        let state = self.state();
        let now = Instant::now();
        let mut keys: Vec<String> = state
            .values
            .keys()
            .chain(state.counters.keys())
            .cloned()
            .chain(
                state
                    .locks
                    .iter()
                    .filter(|(_, (_, expires))| *expires > now)
                    .map(|(k, _)| k.clone()),
            )
            .collect();
        keys.sort();
        keys
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn available(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let state = self.state();
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(state)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let state = self.available()?;
        match state.values.get(key) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    fn notify(&self, gateway: &str) {
        // No receivers is fine
        let _ = self.changes.send(gateway.to_string());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaStore for MemoryStore {
    async fn load_registry(&self, gateway: &str) -> Result<Option<Vec<ServiceEntry>>, StoreError> {
        let loaded: Option<Vec<ServiceEntry>> = self.get_json(&keys::registry(gateway))?;
        let held = self.state().held_load.take();
        if let Some(hold) = held {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
        Ok(loaded)
    }

    async fn create_registry(
        &self,
        gateway: &str,
        services: &[ServiceEntry],
    ) -> Result<bool, StoreError> {
        let json = serde_json::to_string(services)?;
        let created = {
            let mut state = self.available()?;
            let key = keys::registry(gateway);
            if state.values.contains_key(&key) {
                false
            } else {
                state.values.insert(key, json);
                true
            }
        };
        if created {
            self.notify(gateway);
        }
        Ok(created)
    }

    async fn save_registry(
        &self,
        gateway: &str,
        services: &[ServiceEntry],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(services)?;
        self.available()?.values.insert(keys::registry(gateway), json);
        self.notify(gateway);
        Ok(())
    }

    async fn incr_instances(&self, gateway: &str, hash: &str) -> Result<i64, StoreError> {
        let mut state = self.available()?;
        let counter = state.counters.entry(keys::instances(gateway, hash)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn decr_instances(&self, gateway: &str, hash: &str) -> Result<i64, StoreError> {
        let mut state = self.available()?;
        let key = keys::instances(gateway, hash);
        let remaining = state.counters.get(&key).copied().unwrap_or(0) - 1;
        if remaining <= 0 {
            state.counters.remove(&key);
            return Ok(0);
        }
        state.counters.insert(key, remaining);
        Ok(remaining)
    }

    async fn instance_count(&self, gateway: &str, hash: &str) -> Result<i64, StoreError> {
        let state = self.available()?;
        Ok(state
            .counters
            .get(&keys::instances(gateway, hash))
            .copied()
            .unwrap_or(0))
    }

    async fn delete_instances(&self, gateway: &str, hash: &str) -> Result<(), StoreError> {
        self.available()?
            .counters
            .remove(&keys::instances(gateway, hash));
        Ok(())
    }

    async fn put_triage(&self, gateway: &str, entry: &ServiceEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(entry)?;
        self.available()?
            .values
            .insert(keys::triage(gateway, &entry.hash), json);
        Ok(())
    }

    async fn get_triage(
        &self,
        gateway: &str,
        hash: &str,
    ) -> Result<Option<ServiceEntry>, StoreError> {
        self.get_json(&keys::triage(gateway, hash))
    }

    async fn take_triage(
        &self,
        gateway: &str,
        hash: &str,
    ) -> Result<Option<ServiceEntry>, StoreError> {
        let json = self.available()?.values.remove(&keys::triage(gateway, hash));
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_triage(&self, gateway: &str, hash: &str) -> Result<(), StoreError> {
        self.available()?.values.remove(&keys::triage(gateway, hash));
        Ok(())
    }

    async fn set_triage_pointer(
        &self,
        gateway: &str,
        parent_hash: &str,
        child_hash: &str,
    ) -> Result<(), StoreError> {
        self.available()?.values.insert(
            keys::triage_pointer(gateway, parent_hash),
            child_hash.to_string(),
        );
        Ok(())
    }

    async fn get_triage_pointer(
        &self,
        gateway: &str,
        parent_hash: &str,
    ) -> Result<Option<String>, StoreError> {
        let state = self.available()?;
        Ok(state
            .values
            .get(&keys::triage_pointer(gateway, parent_hash))
            .cloned())
    }

    async fn delete_triage_pointer(
        &self,
        gateway: &str,
        parent_hash: &str,
    ) -> Result<(), StoreError> {
        self.available()?
            .values
            .remove(&keys::triage_pointer(gateway, parent_hash));
        Ok(())
    }

    async fn acquire_lock(&self, lease: &LockLease, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.available()?;
        let key = keys::lock(&lease.gateway);
        let now = Instant::now();
        if let Some((_, expires)) = state.locks.get(&key)
            && *expires > now
        {
            return Ok(false);
        }
        state.locks.insert(key, (lease.token.clone(), now + ttl));
        Ok(true)
    }

    async fn release_lock(&self, lease: &LockLease) -> Result<bool, StoreError> {
        let mut state = self.available()?;
        let key = keys::lock(&lease.gateway);
        let owned = state
            .locks
            .get(&key)
            .is_some_and(|(token, expires)| *token == lease.token && *expires > Instant::now());
        if owned {
            state.locks.remove(&key);
        }
        Ok(owned)
    }

    async fn watch_registries(&self) -> Result<BoxStream<'static, String>, StoreError> {
        drop(self.available()?);
        let receiver = self.changes.subscribe();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(gateway) => return Some((gateway, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Change watcher lagged, skipped {} notifications", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
