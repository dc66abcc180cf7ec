//! Hot-reload runtime
//!
//! The live schema sits behind an [`ArcSwapOption`]: a rebuild happens off
//! to the side and is published with a single pointer store, so a request
//! keeps whichever schema it loaded when it started. A failed rebuild leaves
//! the previous schema in place.
//!
//! Change notifications are coalesced through a [`Notify`] permit: while a
//! rebuild runs, any number of notifications leave exactly one rebuild queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use futures::stream::BoxStream;
use rungate::{
    MergedSchema, RetryPolicy, SchemaError, SchemaStore, ServiceEntry, StoreError, merge_schemas,
};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("Gateway {0} has no registered services yet")]
    Missing(String),
}

/// Execution binding for one active service.
#[derive(Debug, Clone)]
pub struct RemoteService {
    pub name: String,
    pub url: String,
    pub hash: String,
}

/// One immutable generation of the gateway's schema.
#[derive(Debug)]
pub struct GatewaySchema {
    merged: MergedSchema,
    services: Vec<RemoteService>,
    sdl: String,
    generation: u64,
}

impl GatewaySchema {
    pub fn build(services: &[ServiceEntry], generation: u64) -> Result<Self, SchemaError> {
        let merged = merge_schemas(services.iter().map(|s| (s.name.as_str(), s.schema.as_str())))?;
        let sdl = merged.sdl();
        let services = services
            .iter()
            .map(|s| RemoteService {
                name: s.name.clone(),
                url: s.url.clone(),
                hash: s.hash.clone(),
            })
            .collect();
        Ok(Self {
            merged,
            services,
            sdl,
            generation,
        })
    }

    pub fn merged(&self) -> &MergedSchema {
        &self.merged
    }

    /// Bindings in merge order; [`MergedSchema::owner`] indexes into this.
    pub fn services(&self) -> &[RemoteService] {
        &self.services
    }

    pub fn sdl(&self) -> &str {
        &self.sdl
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct Runtime {
    gateway: String,
    store: Arc<dyn SchemaStore>,
    retry: RetryPolicy,
    live: ArcSwapOption<GatewaySchema>,
    generations: AtomicU64,
}

impl Runtime {
    pub fn new(gateway: &str, store: Arc<dyn SchemaStore>, retry: RetryPolicy) -> Self {
        Self {
            gateway: gateway.to_string(),
            store,
            retry,
            live: ArcSwapOption::empty(),
            generations: AtomicU64::new(0),
        }
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    /// Schema to serve a request with. `None` until the first build succeeded.
    pub fn current(&self) -> Option<Arc<GatewaySchema>> {
        self.live.load_full()
    }

    /// Rebuild from the store and publish. The live schema is untouched on error.
    pub async fn reload(&self) -> Result<Arc<GatewaySchema>, ReloadError> {
        let services = self
            .store
            .load_registry(&self.gateway)
            .await?
            .ok_or_else(|| ReloadError::Missing(self.gateway.clone()))?;

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let schema = Arc::new(GatewaySchema::build(&services, generation)?);
        self.live.store(Some(schema.clone()));

        info!(
            "Gateway {} now serving generation {} with {} services",
            self.gateway,
            generation,
            services.len()
        );
        Ok(schema)
    }

    /// Load the first schema, then rebuild on every change notification.
    /// Returns only if the first load exhausts the retry policy.
    pub async fn run(self: Arc<Self>) -> Result<(), ReloadError> {
        let trigger = Arc::new(Notify::new());

        // Subscribe before the first read so no write falls between the two
        let initial = match self.store.watch_registries().await {
            Ok(changes) => Some(changes),
            Err(e) => {
                warn!("Change feed unavailable at startup: {}", e);
                None
            }
        };
        let forwarder = tokio::spawn(self.clone().forward_changes(initial, trigger.clone()));

        if let Err(e) = self.reload_with_retry("Startup load").await {
            forwarder.abort();
            return Err(e);
        }

        loop {
            trigger.notified().await;
            if let Err(e) = self.reload_with_retry("Reload").await {
                error!(
                    "Giving up on reload of gateway {}, previous schema stays live: {}",
                    self.gateway, e
                );
            }
        }
    }

    async fn reload_with_retry(&self, phase: &str) -> Result<(), ReloadError> {
        let mut attempt = 0;
        loop {
            match self.reload().await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if !self.retry.allows(attempt) {
                        return Err(e);
                    }
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "{} of gateway {} failed: {}; retrying in {:?}",
                        phase, self.gateway, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn forward_changes(
        self: Arc<Self>,
        mut changes: Option<BoxStream<'static, String>>,
        trigger: Arc<Notify>,
    ) {
        let mut attempt = 0;
        loop {
            if let Some(mut stream) = changes.take() {
                attempt = 0;
                while let Some(gateway) = stream.next().await {
                    if gateway == self.gateway {
                        trigger.notify_one();
                    }
                }
                warn!("Change feed for gateway {} ended", self.gateway);
            }

            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt = attempt.saturating_add(1);

            match self.store.watch_registries().await {
                Ok(stream) => {
                    info!("Resubscribed to changes of gateway {}", self.gateway);
                    changes = Some(stream);
                    // Writes may have been missed while unsubscribed
                    trigger.notify_one();
                }
                Err(e) => error!("Failed to resubscribe for gateway {}: {}", self.gateway, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rungate::MemoryStore;
    use std::time::Duration;

    fn entry(name: &str, hash: &str, sdl: &str) -> ServiceEntry {
        ServiceEntry::new(name, format!("http://{}", name), hash, sdl)
    }

    fn runtime(store: Arc<MemoryStore>) -> Arc<Runtime> {
        Arc::new(Runtime::new(
            "main",
            store,
            RetryPolicy::fixed(Duration::from_millis(10), None),
        ))
    }

    async fn wait_for_generation(runtime: &Runtime, generation: u64) -> Arc<GatewaySchema> {
        for _ in 0..200 {
            if let Some(schema) = runtime.current()
                && schema.generation() >= generation
            {
                return schema;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("generation {} never went live", generation);
    }

    #[tokio::test]
    async fn test_reload_publishes_schema() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_registry("main", &[entry("a", "h1", "type Query { a: Int }")])
            .await
            .unwrap();
        let runtime = runtime(store);

        assert!(runtime.current().is_none());
        let schema = runtime.reload().await.unwrap();
        assert_eq!(schema.generation(), 1);
        assert_eq!(schema.services()[0].name, "a");
        assert!(schema.sdl().contains("a: Int"));
        assert!(Arc::ptr_eq(&runtime.current().unwrap(), &schema));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_schema() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_registry("main", &[entry("a", "h1", "type Query { a: Int }")])
            .await
            .unwrap();
        let runtime = runtime(store.clone());
        let first = runtime.reload().await.unwrap();

        store
            .save_registry(
                "main",
                &[
                    entry("a", "h1", "type Query { a: Int }"),
                    entry("b", "h2", "type Query { a: String }"),
                ],
            )
            .await
            .unwrap();
        assert!(matches!(runtime.reload().await, Err(ReloadError::Schema(_))));

        store.set_unavailable(true);
        assert!(matches!(runtime.reload().await, Err(ReloadError::Store(_))));

        assert!(Arc::ptr_eq(&runtime.current().unwrap(), &first));
    }

    #[tokio::test]
    async fn test_missing_registry_is_retried_until_present() {
        let store = Arc::new(MemoryStore::new());
        let runtime = runtime(store.clone());
        tokio::spawn(runtime.clone().run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runtime.current().is_none());

        store
            .create_registry("main", &[entry("a", "h1", "type Query { a: Int }")])
            .await
            .unwrap();
        let schema = wait_for_generation(&runtime, 1).await;
        assert_eq!(schema.services().len(), 1);
    }

    #[tokio::test]
    async fn test_startup_gives_up_after_max_attempts() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(Runtime::new(
            "main",
            store,
            RetryPolicy::fixed(Duration::from_millis(1), Some(2)),
        ));

        let result = runtime.run().await;
        assert!(matches!(result, Err(ReloadError::Missing(_))));
    }

    #[tokio::test]
    async fn test_store_write_triggers_hot_swap() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_registry("main", &[entry("a", "h1", "type Query { a: Int }")])
            .await
            .unwrap();
        let runtime = runtime(store.clone());
        tokio::spawn(runtime.clone().run());
        let first = wait_for_generation(&runtime, 1).await;

        store
            .save_registry(
                "main",
                &[
                    entry("a", "h1", "type Query { a: Int }"),
                    entry("b", "h2", "type Query { b: Int }"),
                ],
            )
            .await
            .unwrap();

        let second = wait_for_generation(&runtime, 2).await;
        assert_eq!(second.services().len(), 2);
        // A request holding the first generation still sees it whole
        assert_eq!(first.services().len(), 1);
        assert!(first.sdl().contains("a: Int") && !first.sdl().contains("b: Int"));
    }

    #[tokio::test]
    async fn test_other_gateways_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_registry("main", &[entry("a", "h1", "type Query { a: Int }")])
            .await
            .unwrap();
        let runtime = runtime(store.clone());
        tokio::spawn(runtime.clone().run());
        wait_for_generation(&runtime, 1).await;

        store
            .create_registry("other", &[entry("x", "x1", "type Query { x: Int }")])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(runtime.current().unwrap().generation(), 1);
    }

    #[tokio::test]
    async fn test_notifications_during_rebuild_coalesce() {
        let v1 = [entry("a", "h1", "type Query { a: Int }")];
        let v2 = [
            entry("a", "h1", "type Query { a: Int }"),
            entry("b", "h2", "type Query { b: Int }"),
        ];
        let store = Arc::new(MemoryStore::new());
        store.create_registry("main", &v1).await.unwrap();
        let runtime = runtime(store.clone());
        tokio::spawn(runtime.clone().run());
        wait_for_generation(&runtime, 1).await;

        let hold = store.hold_next_load();
        store.save_registry("main", &v2).await.unwrap();
        hold.reached().await;

        for _ in 0..20 {
            store.save_registry("main", &v2).await.unwrap();
        }
        // Let the forwarder drain the burst while the rebuild is parked
        tokio::time::sleep(Duration::from_millis(50)).await;
        hold.release();

        wait_for_generation(&runtime, 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let schema = runtime.current().unwrap();
        assert_eq!(schema.generation(), 3);
        assert_eq!(schema.services().len(), 2);
    }
}
