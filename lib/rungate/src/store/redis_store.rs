//! Redis-backed store adapter
//!
//! Change notifications ride on redis keyspace events: every `SET` of a
//! `schema:<gateway>` key is published on `__keyevent@<db>__:set`. The
//! adapter asks redis to enable them on connect, which managed deployments
//! may refuse; in that case they have to be enabled out of band.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient, Script};
use std::sync::LazyLock;
use std::time::Duration;

use super::{LockLease, SchemaStore};
use crate::{error::StoreError, keys, types::ServiceEntry};

const KEYSPACE_EVENTS: &str = "AKE";

/// Decrement and delete at zero in one round trip, so a negative count is never stored.
static DECR_FLOOR: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local remaining = redis.call('DECR', KEYS[1])
        if remaining <= 0 then
            redis.call('DEL', KEYS[1])
            return 0
        end
        return remaining
        ",
    )
});

/// Delete the lock only when the caller's token still owns it.
static RELEASE_LOCK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        ",
    )
});

#[derive(Clone)]
pub struct RedisSchemaStore {
    client: RedisClient,
    conn: ConnectionManager,
}

impl RedisSchemaStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = RedisClient::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let store = Self { client, conn };
        store.enable_keyspace_events().await;
        Ok(store)
    }

    async fn enable_keyspace_events(&self) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(KEYSPACE_EVENTS)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(
                "Could not enable keyspace notifications ({}); gateways will not hot reload unless they are enabled",
                e
            );
        }
    }

    fn set_event_channel(&self) -> String {
        format!("__keyevent@{}__:set", self.client.get_connection_info().redis.db)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(key).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SchemaStore for RedisSchemaStore {
    async fn load_registry(&self, gateway: &str) -> Result<Option<Vec<ServiceEntry>>, StoreError> {
        self.get_json(&keys::registry(gateway)).await
    }

    async fn create_registry(
        &self,
        gateway: &str,
        services: &[ServiceEntry],
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(services)?;
        let created: bool = conn.set_nx(keys::registry(gateway), json).await?;
        Ok(created)
    }

    async fn save_registry(
        &self,
        gateway: &str,
        services: &[ServiceEntry],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(services)?;
        let _: () = conn.set(keys::registry(gateway), json).await?;
        Ok(())
    }

    async fn incr_instances(&self, gateway: &str, hash: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(keys::instances(gateway, hash), 1).await?;
        Ok(count)
    }

    async fn decr_instances(&self, gateway: &str, hash: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = DECR_FLOOR
            .key(keys::instances(gateway, hash))
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining)
    }

    async fn instance_count(&self, gateway: &str, hash: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = conn.get(keys::instances(gateway, hash)).await?;
        Ok(count.unwrap_or(0).max(0))
    }

    async fn delete_instances(&self, gateway: &str, hash: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::instances(gateway, hash)).await?;
        Ok(())
    }

    async fn put_triage(&self, gateway: &str, entry: &ServiceEntry) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(entry)?;
        let _: () = conn.set(keys::triage(gateway, &entry.hash), json).await?;
        Ok(())
    }

    async fn get_triage(
        &self,
        gateway: &str,
        hash: &str,
    ) -> Result<Option<ServiceEntry>, StoreError> {
        self.get_json(&keys::triage(gateway, hash)).await
    }

    async fn take_triage(
        &self,
        gateway: &str,
        hash: &str,
    ) -> Result<Option<ServiceEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let key = keys::triage(gateway, hash);
        let (json, _deleted): (Option<String>, i64) = redis::pipe()
            .atomic()
            .get(&key)
            .del(&key)
            .query_async(&mut conn)
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_triage(&self, gateway: &str, hash: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::triage(gateway, hash)).await?;
        Ok(())
    }

    async fn set_triage_pointer(
        &self,
        gateway: &str,
        parent_hash: &str,
        child_hash: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(keys::triage_pointer(gateway, parent_hash), child_hash)
            .await?;
        Ok(())
    }

    async fn get_triage_pointer(
        &self,
        gateway: &str,
        parent_hash: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let child: Option<String> = conn.get(keys::triage_pointer(gateway, parent_hash)).await?;
        Ok(child)
    }

    async fn delete_triage_pointer(
        &self,
        gateway: &str,
        parent_hash: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::triage_pointer(gateway, parent_hash)).await?;
        Ok(())
    }

    async fn acquire_lock(&self, lease: &LockLease, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(keys::lock(&lease.gateway))
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, lease: &LockLease) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = RELEASE_LOCK
            .key(keys::lock(&lease.gateway))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn watch_registries(&self) -> Result<BoxStream<'static, String>, StoreError> {
        let channel = self.set_event_channel();
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        tracing::info!("Subscribed to Redis channel: {}", channel);

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let key: String = match msg.get_payload() {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!("Failed to get Redis message payload: {}", e);
                    return None;
                }
            };
            keys::parse_registry_key(&key).map(str::to_string)
        });
        Ok(Box::pin(stream))
    }
}
