#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the redis store adapter
//!
//! Uses testcontainers to spin up a Redis instance.

use std::time::Duration;

use futures::StreamExt;
use rungate::{LockLease, RedisSchemaStore, SchemaStore, ServiceEntry};
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::{REDIS_PORT, Redis};

async fn setup_store() -> (ContainerAsync<Redis>, RedisSchemaStore) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start Redis container");

    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get port");

    let store = RedisSchemaStore::connect(&format!("redis://127.0.0.1:{}", port))
        .await
        .expect("Failed to connect to Redis");

    (container, store)
}

fn entry(name: &str, hash: &str) -> ServiceEntry {
    ServiceEntry::new(name, format!("http://{}/graphql", name), hash, "type Query { a: Int }")
}

#[tokio::test]
#[ignore = "Requires Docker for Redis testcontainer"]
async fn test_registry_created_once() {
    let (_container, store) = setup_store().await;

    assert!(store.load_registry("main").await.unwrap().is_none());
    assert!(store.create_registry("main", &[entry("a", "h1")]).await.unwrap());
    assert!(!store.create_registry("main", &[entry("b", "h2")]).await.unwrap());

    let services = store.load_registry("main").await.unwrap().unwrap();
    assert_eq!(services, vec![entry("a", "h1")]);
}

#[tokio::test]
#[ignore = "Requires Docker for Redis testcontainer"]
async fn test_counter_floors_and_deletes() {
    let (_container, store) = setup_store().await;

    assert_eq!(store.incr_instances("main", "h1").await.unwrap(), 1);
    assert_eq!(store.incr_instances("main", "h1").await.unwrap(), 2);
    assert_eq!(store.decr_instances("main", "h1").await.unwrap(), 1);
    assert_eq!(store.decr_instances("main", "h1").await.unwrap(), 0);
    assert_eq!(store.decr_instances("main", "h1").await.unwrap(), 0);
    assert_eq!(store.instance_count("main", "h1").await.unwrap(), 0);
    assert_eq!(store.incr_instances("main", "h1").await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "Requires Docker for Redis testcontainer"]
async fn test_triage_take_removes_entry() {
    let (_container, store) = setup_store().await;
    let child = entry("a", "h2").with_parent("h1");

    store.put_triage("main", &child).await.unwrap();
    store.set_triage_pointer("main", "h1", "h2").await.unwrap();
    assert_eq!(
        store.get_triage_pointer("main", "h1").await.unwrap().as_deref(),
        Some("h2")
    );

    assert_eq!(store.take_triage("main", "h2").await.unwrap(), Some(child));
    assert!(store.take_triage("main", "h2").await.unwrap().is_none());

    store.delete_triage_pointer("main", "h1").await.unwrap();
    assert!(store.get_triage_pointer("main", "h1").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "Requires Docker for Redis testcontainer"]
async fn test_lease_is_exclusive_and_owner_checked() {
    let (_container, store) = setup_store().await;
    let first = LockLease::new("main");
    let second = LockLease::new("main");

    assert!(store.acquire_lock(&first, Duration::from_secs(5)).await.unwrap());
    assert!(!store.acquire_lock(&second, Duration::from_secs(5)).await.unwrap());
    assert!(!store.release_lock(&second).await.unwrap());
    assert!(store.release_lock(&first).await.unwrap());
    assert!(store.acquire_lock(&second, Duration::from_secs(5)).await.unwrap());
}

#[tokio::test]
#[ignore = "Requires Docker for Redis testcontainer"]
async fn test_lease_expires() {
    let (_container, store) = setup_store().await;
    let crashed = LockLease::new("main");
    let next = LockLease::new("main");

    assert!(store.acquire_lock(&crashed, Duration::from_millis(100)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(store.acquire_lock(&next, Duration::from_secs(5)).await.unwrap());
}

#[tokio::test]
#[ignore = "Requires Docker for Redis testcontainer"]
async fn test_watch_reports_registry_writes_only() {
    let (_container, store) = setup_store().await;
    let mut changes = store.watch_registries().await.unwrap();

    store.incr_instances("main", "h1").await.unwrap();
    store.put_triage("main", &entry("a", "h2")).await.unwrap();
    store.save_registry("main", &[entry("a", "h1")]).await.unwrap();

    let gateway = tokio::time::timeout(Duration::from_secs(5), changes.next())
        .await
        .expect("no notification")
        .unwrap();
    assert_eq!(gateway, "main");
}
