#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the gateway's HTTP surface
//!
//! Downstream services are small axum apps on loopback ports that record what
//! they receive and answer with canned data.

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    routing::post,
};
use http_body_util::BodyExt;
use rungate::{MemoryStore, RetryPolicy, SchemaStore, ServiceEntry};
use rungate_gateway::handlers::AppState;
use rungate_gateway::{Executor, GraphQlRequest, GraphQlResponse, Runtime, create_router};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

const USERS_SDL: &str = "type Query { me: User } type Mutation { rename(name: String!): User } type User { id: ID! name: String }";
const POSTS_SDL: &str = "type Query { posts(first: Int): [Post] } type Post { id: ID! title: String }";

#[derive(Clone)]
struct Downstream {
    data: Value,
    received: Arc<Mutex<Vec<GraphQlRequest>>>,
}

async fn answer(
    State(downstream): State<Downstream>,
    Json(request): Json<GraphQlRequest>,
) -> Json<Value> {
    downstream.received.lock().unwrap().push(request);
    Json(json!({ "data": downstream.data }))
}

/// Serve canned `data` on a loopback port; returns the URL and the request log.
async fn spawn_service(data: Value) -> (String, Arc<Mutex<Vec<GraphQlRequest>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().route("/graphql", post(answer)).with_state(Downstream {
        data,
        received: received.clone(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/graphql", addr), received)
}

fn gateway(store: Arc<MemoryStore>) -> (Arc<Runtime>, Router) {
    let runtime = Arc::new(Runtime::new(
        "main",
        store,
        RetryPolicy::fixed(Duration::from_millis(10), None),
    ));
    let state = Arc::new(AppState {
        runtime: runtime.clone(),
        executor: Executor::new(Duration::from_secs(5)),
    });
    (runtime, create_router(state))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn graphql(app: &Router, body: Value) -> (StatusCode, GraphQlResponse) {
    let (status, body) = send(
        app,
        Request::builder()
            .method("POST")
            .uri("/graphql")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
    )
    .await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health() {
    let (_, app) = gateway(Arc::new(MemoryStore::new()));
    let (status, _) = send(&app, Request::builder().uri("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unavailable_before_first_schema() {
    let (_, app) = gateway(Arc::new(MemoryStore::new()));

    let (status, response) = graphql(&app, json!({ "query": "{ me { id } }" })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.data.is_none());
    assert_eq!(response.errors.len(), 1);

    let (status, _) = send(&app, Request::builder().uri("/sdl").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_root_fields_are_delegated_to_their_owners() {
    let (users_url, users_log) = spawn_service(json!({ "me": { "id": "u1", "name": "Ada" } })).await;
    let (posts_url, posts_log) = spawn_service(json!({ "top": [{ "id": "p1" }] })).await;

    let store = Arc::new(MemoryStore::new());
    store
        .create_registry(
            "main",
            &[
                ServiceEntry::new("users", users_url, "u1", USERS_SDL),
                ServiceEntry::new("posts", posts_url, "p1", POSTS_SDL),
            ],
        )
        .await
        .unwrap();
    let (runtime, app) = gateway(store);
    runtime.reload().await.unwrap();

    let (status, response) = graphql(
        &app,
        json!({
            "query": "query Home($n: Int) { me { id name } top: posts(first: $n) { id } __typename }",
            "variables": { "n": 3 },
            "operationName": "Home"
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(response.errors.is_empty());
    assert_eq!(
        response.data.unwrap(),
        json!({
            "me": { "id": "u1", "name": "Ada" },
            "top": [{ "id": "p1" }],
            "__typename": "Query"
        })
    );

    let users = users_log.lock().unwrap();
    assert_eq!(users.len(), 1);
    assert!(users[0].query.contains("me"));
    assert!(!users[0].query.contains("posts"));
    assert!(users[0].variables.as_ref().unwrap().is_empty());

    let posts = posts_log.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].query.contains("top: posts(first: $n)"));
    assert_eq!(posts[0].variables.as_ref().unwrap()["n"], json!(3));
    assert_eq!(posts[0].operation_name.as_deref(), Some("Home"));
}

#[tokio::test]
async fn test_unreachable_service_nulls_its_fields() {
    let (users_url, _) = spawn_service(json!({ "me": { "id": "u1" } })).await;
    let store = Arc::new(MemoryStore::new());
    store
        .create_registry(
            "main",
            &[
                ServiceEntry::new("users", users_url, "u1", USERS_SDL),
                ServiceEntry::new("posts", "http://127.0.0.1:1/graphql", "p1", POSTS_SDL),
            ],
        )
        .await
        .unwrap();
    let (runtime, app) = gateway(store);
    runtime.reload().await.unwrap();

    let (status, response) = graphql(&app, json!({ "query": "{ me { id } posts { id } }" })).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        response.data.unwrap(),
        json!({ "me": { "id": "u1" }, "posts": null })
    );
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0]["path"], json!(["posts"]));
}

#[tokio::test]
async fn test_get_queries_and_rejects_mutations() {
    let (users_url, users_log) = spawn_service(json!({ "me": { "id": "u1" } })).await;
    let store = Arc::new(MemoryStore::new());
    store
        .create_registry("main", &[ServiceEntry::new("users", users_url, "u1", USERS_SDL)])
        .await
        .unwrap();
    let (runtime, app) = gateway(store);
    runtime.reload().await.unwrap();

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/graphql?query=%7B%20me%20%7B%20id%20%7D%20%7D")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: GraphQlResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.data.unwrap(), json!({ "me": { "id": "u1" } }));

    let (status, _) = send(
        &app,
        Request::builder()
            .uri("/graphql?query=mutation%20%7B%20rename(name%3A%20%22x%22)%20%7B%20id%20%7D%20%7D")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(users_log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    store
        .create_registry(
            "main",
            &[ServiceEntry::new("users", "http://127.0.0.1:1/graphql", "u1", USERS_SDL)],
        )
        .await
        .unwrap();
    let (runtime, app) = gateway(store);
    runtime.reload().await.unwrap();

    let (status, response) = graphql(&app, json!({ "query": "{ unknown }" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response.errors[0]["message"].as_str().unwrap().contains("unknown"));

    let (status, _) = graphql(&app, json!({ "query": "{ me {" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/graphql")
            .header("content-type", "application/json")
            .body(Body::from("not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_registry_write_hot_swaps_schema() {
    let (users_url, _) = spawn_service(json!({ "me": { "id": "u1" } })).await;
    let (posts_url, _) = spawn_service(json!({ "posts": [] })).await;

    let store = Arc::new(MemoryStore::new());
    let users = ServiceEntry::new("users", users_url, "u1", USERS_SDL);
    store.create_registry("main", &[users.clone()]).await.unwrap();
    let (runtime, app) = gateway(store.clone());
    tokio::spawn(runtime.clone().run());

    let mut loaded = false;
    for _ in 0..200 {
        if runtime.current().is_some() {
            loaded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(loaded);

    let (status, _) = graphql(&app, json!({ "query": "{ posts { id } }" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    store
        .save_registry(
            "main",
            &[users, ServiceEntry::new("posts", posts_url, "p1", POSTS_SDL)],
        )
        .await
        .unwrap();

    let mut swapped = false;
    for _ in 0..200 {
        if runtime.current().map(|s| s.services().len()) == Some(2) {
            swapped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(swapped);

    let (status, response) = graphql(&app, json!({ "query": "{ posts { id } }" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.data.unwrap(), json!({ "posts": [] }));

    let (_, body) = send(&app, Request::builder().uri("/sdl").body(Body::empty()).unwrap()).await;
    let sdl = String::from_utf8(body).unwrap();
    assert!(sdl.contains("posts"));
}
