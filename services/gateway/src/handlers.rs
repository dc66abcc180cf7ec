//! Gateway HTTP handlers

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::executor::{ExecutionError, Executor, GraphQlRequest, GraphQlResponse};
use crate::runtime::{GatewaySchema, Runtime};

pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub executor: Executor,
}

/// A request that never reached execution, reported in GraphQL error shape.
pub struct ApiError(pub StatusCode, pub Json<GraphQlResponse>);

impl ApiError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        ApiError(status, Json(GraphQlResponse::error(msg)))
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn method_not_allowed(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, msg)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, msg)
    }
}

impl From<ExecutionError> for ApiError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::Request(msg) => ApiError::bad_request(msg),
            ExecutionError::MutationOverGet => ApiError::method_not_allowed(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::bad_request(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0;
        let mut response = (status, self.1).into_response();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            response
                .headers_mut()
                .insert(header::ALLOW, header::HeaderValue::from_static("POST"));
        }
        response
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetParams {
    pub query: String,
    /// JSON-encoded variables object
    pub variables: Option<String>,
    pub operation_name: Option<String>,
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Merged SDL of the live generation.
pub async fn sdl(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    let schema = live(&state)?;
    Ok(schema.sdl().to_string())
}

pub async fn graphql_post(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GraphQlRequest>, JsonRejection>,
) -> Result<Json<GraphQlResponse>, ApiError> {
    let Json(request) = body?;
    execute(&state, &request, true).await
}

pub async fn graphql_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GetParams>,
) -> Result<Json<GraphQlResponse>, ApiError> {
    let variables = match params.variables.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            serde_json::from_str::<Map<String, Value>>(raw)
                .map_err(|e| ApiError::bad_request(format!("Invalid variables: {}", e)))?,
        ),
    };
    let request = GraphQlRequest {
        query: params.query,
        variables,
        operation_name: params.operation_name,
    };
    execute(&state, &request, false).await
}

async fn execute(
    state: &AppState,
    request: &GraphQlRequest,
    allow_mutations: bool,
) -> Result<Json<GraphQlResponse>, ApiError> {
    // Pin one generation for the whole request
    let schema = live(state)?;
    tracing::debug!(
        "Executing {:?} on generation {}",
        request.operation_name,
        schema.generation()
    );
    let response = state
        .executor
        .execute(&schema, request, allow_mutations)
        .await?;
    Ok(Json(response))
}

fn live(state: &AppState) -> Result<Arc<GatewaySchema>, ApiError> {
    state.runtime.current().ok_or_else(|| {
        ApiError::unavailable(format!(
            "Gateway {} has no schema loaded yet",
            state.runtime.gateway()
        ))
    })
}
