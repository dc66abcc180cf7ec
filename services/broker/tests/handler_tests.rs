#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the broker's HTTP surface
//!
//! Runs the router against the in-memory store and a canned introspector.

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use rungate::{
    DeregistrationOutcome, DeregistrationResponse, ErrorCode, ErrorResponse, MemoryStore,
    RegistrationOutcome, RegistrationResponse, SchemaStore, ServiceEntry,
};
use rungate_broker::handlers::AppState;
use rungate_broker::{IntrospectionError, Introspector, Projection, Registry, create_router};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

const USERS_V1: &str = "type Query { user(id: ID!): User } type User { id: ID! name: String }";
const USERS_V2: &str = "type Query { user(id: ID!): User } type User { id: ID! }";

struct CannedIntrospector(HashMap<String, String>);

#[async_trait]
impl Introspector for CannedIntrospector {
    async fn introspect(&self, url: &str) -> Result<String, IntrospectionError> {
        self.0
            .get(url)
            .cloned()
            .ok_or_else(|| IntrospectionError::Status {
                url: url.to_string(),
                status: 500,
            })
    }
}

fn setup() -> (Arc<MemoryStore>, Router) {
    let store = Arc::new(MemoryStore::new());
    let introspector = CannedIntrospector(HashMap::from([
        ("http://users/v1".to_string(), USERS_V1.to_string()),
        ("http://users/v2".to_string(), USERS_V2.to_string()),
    ]));
    let state = Arc::new(AppState {
        registry: Registry::new(store.clone(), Arc::new(introspector)),
        projection: Arc::new(Projection::new(store.clone())),
    });
    (store, create_router(state))
}

async fn post(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

fn register_body(url: &str, hash: &str) -> serde_json::Value {
    serde_json::json!({ "name": "users", "url": url, "hash": hash, "gateway": "main" })
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_store, app) = setup();
    let (status, _) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_register_then_list() {
    let (_store, app) = setup();

    let (status, body) = post(&app, "/register", register_body("http://users/v1", "h1")).await;
    assert_eq!(status, StatusCode::OK);
    let response: RegistrationResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.outcome, RegistrationOutcome::Bootstrapped);
    let raw: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(raw["status"], "REGISTRATION_SUCCESS");

    let (status, body) = get(&app, "/schemas/main").await;
    assert_eq!(status, StatusCode::OK);
    let services: Vec<ServiceEntry> = serde_json::from_slice(&body).unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].hash, "h1");
    assert!(services[0].schema.contains("User"));
}

#[tokio::test]
async fn test_unknown_gateway_is_not_found() {
    let (_store, app) = setup();
    let (status, body) = get(&app, "/schemas/nowhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn test_missing_fields_are_bad_request() {
    let (store, app) = setup();
    let (status, body) = post(&app, "/register", serde_json::json!({ "name": "users" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.code, ErrorCode::BadRequest);
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn test_empty_body_is_bad_request() {
    let (_store, app) = setup();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/register")
                .header("content-type", "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unreachable_service_is_bad_gateway() {
    let (store, app) = setup();
    let (status, body) = post(&app, "/register", register_body("http://users/down", "h1")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.code, ErrorCode::BadGateway);
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn test_staged_rollout_over_http() {
    let (store, app) = setup();
    post(&app, "/register", register_body("http://users/v1", "h1")).await;

    let (status, body) = post(&app, "/register", register_body("http://users/v2", "h2")).await;
    assert_eq!(status, StatusCode::OK);
    let response: RegistrationResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.outcome, RegistrationOutcome::Triaged);

    let (status, body) = get(&app, "/schemas/main/triage/h1").await;
    assert_eq!(status, StatusCode::OK);
    let staged: ServiceEntry = serde_json::from_slice(&body).unwrap();
    assert_eq!(staged.hash, "h2");
    assert_eq!(staged.parent_hash.as_deref(), Some("h1"));

    let (status, body) = post(
        &app,
        "/deregister",
        serde_json::json!({ "name": "users", "hash": "h1", "gateway": "main" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: DeregistrationResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.outcome, DeregistrationOutcome::Promoted);
    assert_eq!(response.promoted.as_deref(), Some("h2"));

    let (_, body) = get(&app, "/schemas/main").await;
    let services: Vec<ServiceEntry> = serde_json::from_slice(&body).unwrap();
    assert_eq!(services[0].hash, "h2");
    assert!(store.get_triage("main", "h2").await.unwrap().is_none());

    let (status, _) = get(&app, "/schemas/main/triage/h1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_new_name_on_taken_url_conflicts() {
    let (_store, app) = setup();
    post(&app, "/register", register_body("http://users/v1", "h1")).await;

    let (status, body) = post(
        &app,
        "/register",
        serde_json::json!({ "name": "accounts", "url": "http://users/v1", "hash": "a1", "gateway": "main" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.code, ErrorCode::Conflict);
}

#[tokio::test]
async fn test_deregister_unknown_gateway() {
    let (_store, app) = setup();
    let (status, _) = post(
        &app,
        "/deregister",
        serde_json::json!({ "name": "users", "hash": "h1", "gateway": "main" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_store_outage_is_internal_error() {
    let (store, app) = setup();
    store.set_unavailable(true);
    let (status, body) = post(&app, "/register", register_body("http://users/v1", "h1")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.code, ErrorCode::InternalError);
}
