//! In-memory projection of each gateway's active service list.
//!
//! The store is the source of truth. Entries are filled on read, refreshed
//! after this broker mutates a gateway and dropped whenever the store reports
//! a registry write, so a replica never serves state it did not reread.
//!
//! Every drop bumps an epoch. A refresh only stores what it read if no drop
//! happened while it was reading, so a slow read cannot reinstate a registry
//! that was already invalidated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rungate::{RetryPolicy, SchemaStore, ServiceEntry, StoreError};
use tokio::sync::RwLock;

#[derive(Default)]
struct Cache {
    entries: HashMap<String, Arc<Vec<ServiceEntry>>>,
    epochs: HashMap<String, u64>,
    clears: u64,
}

impl Cache {
    fn epoch(&self, gateway: &str) -> (u64, u64) {
        (self.clears, self.epochs.get(gateway).copied().unwrap_or(0))
    }
}

pub struct Projection {
    store: Arc<dyn SchemaStore>,
    cache: RwLock<Cache>,
}

impl Projection {
    pub fn new(store: Arc<dyn SchemaStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Active services of `gateway`, reading through to the store on a miss.
    pub async fn get(&self, gateway: &str) -> Result<Option<Arc<Vec<ServiceEntry>>>, StoreError> {
        if let Some(services) = self.cache.read().await.entries.get(gateway) {
            return Ok(Some(services.clone()));
        }
        self.refresh(gateway).await
    }

    /// Reread `gateway` from the store. The result is always returned but only
    /// cached when nothing invalidated the gateway during the read.
    pub async fn refresh(
        &self,
        gateway: &str,
    ) -> Result<Option<Arc<Vec<ServiceEntry>>>, StoreError> {
        let before = self.cache.read().await.epoch(gateway);
        let loaded = self.store.load_registry(gateway).await?.map(Arc::new);

        let mut cache = self.cache.write().await;
        if cache.epoch(gateway) != before {
            tracing::debug!("Projection of {} invalidated during refresh, not cached", gateway);
            return Ok(loaded);
        }
        match &loaded {
            Some(services) => {
                cache.entries.insert(gateway.to_string(), services.clone());
            }
            None => {
                cache.entries.remove(gateway);
            }
        }
        Ok(loaded)
    }

    pub async fn invalidate(&self, gateway: &str) {
        let mut cache = self.cache.write().await;
        cache.entries.remove(gateway);
        *cache.epochs.entry(gateway.to_string()).or_default() += 1;
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.entries.clear();
        cache.clears += 1;
    }

    pub async fn cached(&self, gateway: &str) -> bool {
        self.cache.read().await.entries.contains_key(gateway)
    }
}

/// Drops projected entries as the store reports registry writes. Resubscribes
/// after the feed fails; everything is dropped then since events may have been missed.
pub async fn projection_sync_subscriber(store: Arc<dyn SchemaStore>, projection: Arc<Projection>) {
    let retry = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(30), None);
    let mut attempt = 0;

    loop {
        match store.watch_registries().await {
            Ok(mut changes) => {
                attempt = 0;
                projection.clear().await;
                while let Some(gateway) = changes.next().await {
                    tracing::debug!("Projection sync: registry of {} changed", gateway);
                    projection.invalidate(&gateway).await;
                }
                tracing::warn!("Projection sync: change feed ended");
            }
            Err(e) => tracing::error!("Projection sync: {}", e),
        }

        tokio::time::sleep(retry.delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rungate::MemoryStore;

    fn entry(name: &str, hash: &str) -> ServiceEntry {
        ServiceEntry::new(name, format!("http://{}", name), hash, "type Query { a: Int }")
    }

    #[tokio::test]
    async fn test_read_through_and_invalidate() {
        let store = Arc::new(MemoryStore::new());
        let projection = Projection::new(store.clone());

        assert!(projection.get("main").await.unwrap().is_none());

        store.create_registry("main", &[entry("a", "h1")]).await.unwrap();
        let services = projection.get("main").await.unwrap().unwrap();
        assert_eq!(services[0].hash, "h1");
        assert!(projection.cached("main").await);

        store.save_registry("main", &[entry("a", "h2")]).await.unwrap();
        let stale = projection.get("main").await.unwrap().unwrap();
        assert_eq!(stale[0].hash, "h1");

        projection.invalidate("main").await;
        let fresh = projection.get("main").await.unwrap().unwrap();
        assert_eq!(fresh[0].hash, "h2");
    }

    #[tokio::test]
    async fn test_subscriber_invalidates_on_write() {
        let store = Arc::new(MemoryStore::new());
        let projection = Arc::new(Projection::new(store.clone()));
        store.create_registry("main", &[entry("a", "h1")]).await.unwrap();

        tokio::spawn(projection_sync_subscriber(store.clone(), projection.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        projection.get("main").await.unwrap();
        store.save_registry("main", &[entry("a", "h2")]).await.unwrap();

        let mut invalidated = false;
        for _ in 0..50 {
            if !projection.cached("main").await {
                invalidated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(invalidated);
        assert_eq!(projection.get("main").await.unwrap().unwrap()[0].hash, "h2");
    }

    #[tokio::test]
    async fn test_invalidation_during_refresh_is_not_overwritten() {
        let store = Arc::new(MemoryStore::new());
        store.create_registry("main", &[entry("a", "h1")]).await.unwrap();
        let projection = Arc::new(Projection::new(store.clone()));

        let hold = store.hold_next_load();
        let reader = tokio::spawn({
            let projection = projection.clone();
            async move { projection.get("main").await }
        });
        hold.reached().await;

        store.save_registry("main", &[entry("a", "h2")]).await.unwrap();
        projection.invalidate("main").await;
        hold.release();

        // The slow reader still answers with what it read
        let read = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(read[0].hash, "h1");
        assert!(!projection.cached("main").await);
        assert_eq!(projection.get("main").await.unwrap().unwrap()[0].hash, "h2");
    }

    #[tokio::test]
    async fn test_clear_during_refresh_is_not_overwritten() {
        let store = Arc::new(MemoryStore::new());
        store.create_registry("main", &[entry("a", "h1")]).await.unwrap();
        let projection = Arc::new(Projection::new(store.clone()));

        let hold = store.hold_next_load();
        let reader = tokio::spawn({
            let projection = projection.clone();
            async move { projection.refresh("main").await }
        });
        hold.reached().await;
        projection.clear().await;
        hold.release();

        reader.await.unwrap().unwrap();
        assert!(!projection.cached("main").await);
    }
}
