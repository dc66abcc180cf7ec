//! Broker REST API handlers

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rungate::{
    DeregisterRequest, DeregistrationResponse, ErrorCode, ErrorResponse, RegisterRequest,
    RegistrationResponse, RegistrationStatus, ServiceEntry, StoreError, keys,
};
use std::sync::Arc;

use crate::projection::Projection;
use crate::registry::{Registry, RegistryError};

pub struct AppState {
    pub registry: Registry,
    pub projection: Arc<Projection>,
}

pub struct ApiError(pub StatusCode, pub Json<ErrorResponse>);

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, msg: impl Into<String>) -> Self {
        ApiError(
            status,
            Json(ErrorResponse {
                error: msg.into(),
                code,
            }),
        )
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, ErrorCode::Conflict, msg)
    }

    pub fn locked(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, ErrorCode::Locked, msg)
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, ErrorCode::BadGateway, msg)
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            msg,
        )
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Validation(msg) => ApiError::bad_request(msg),
            RegistryError::NotFound(what) => ApiError::not_found(format!("Unknown {}", what)),
            RegistryError::Conflict(msg) => ApiError::conflict(msg),
            RegistryError::Locked(gateway) => {
                ApiError::locked(format!("Gateway {} is busy, retry later", gateway))
            }
            RegistryError::Downstream(e) => ApiError::bad_gateway(e.to_string()),
            RegistryError::Store(e) => ApiError::internal_error(format!("Storage error: {}", e)),
            RegistryError::Schema(e) => ApiError::internal_error(format!("Schema error: {}", e)),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::internal_error(format!("Storage error: {}", e))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::bad_request(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegistrationResponse>, ApiError> {
    let Json(request) = body?;
    let outcome = state.registry.register(&request).await?;
    refresh_projection(&state, &request.gateway).await;

    Ok(Json(RegistrationResponse {
        status: RegistrationStatus::RegistrationSuccess,
        name: request.name,
        url: request.url,
        hash: request.hash,
        gateway: request.gateway,
        outcome,
    }))
}

pub async fn deregister(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DeregisterRequest>, JsonRejection>,
) -> Result<Json<DeregistrationResponse>, ApiError> {
    let Json(request) = body?;
    let result = state.registry.deregister(&request).await?;
    refresh_projection(&state, &request.gateway).await;

    Ok(Json(DeregistrationResponse {
        status: RegistrationStatus::DeRegistrationSuccess,
        name: request.name,
        hash: request.hash,
        gateway: request.gateway,
        outcome: result.outcome,
        promoted: result.promoted,
    }))
}

pub async fn get_schemas(
    State(state): State<Arc<AppState>>,
    Path(gateway): Path<String>,
) -> Result<Json<Vec<ServiceEntry>>, ApiError> {
    if !keys::is_valid_gateway(&gateway) {
        return Err(ApiError::bad_request(format!(
            "Invalid gateway name {:?}",
            gateway
        )));
    }

    match state.projection.get(&gateway).await? {
        Some(services) => Ok(Json(services.as_ref().clone())),
        None => Err(ApiError::not_found(format!("Unknown gateway {}", gateway))),
    }
}

/// Staged successor of an active hash.
pub async fn get_triage(
    State(state): State<Arc<AppState>>,
    Path((gateway, parent_hash)): Path<(String, String)>,
) -> Result<Json<ServiceEntry>, ApiError> {
    if !keys::is_valid_gateway(&gateway) {
        return Err(ApiError::bad_request(format!(
            "Invalid gateway name {:?}",
            gateway
        )));
    }

    let store = state.registry.store();
    let child = store
        .get_triage_pointer(&gateway, &parent_hash)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("No rollout staged for {}", parent_hash)))?;
    let entry = store
        .get_triage(&gateway, &child)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("No rollout staged for {}", parent_hash)))?;
    Ok(Json(entry))
}

async fn refresh_projection(state: &AppState, gateway: &str) {
    if let Err(e) = state.projection.refresh(gateway).await {
        tracing::warn!("Failed to refresh projection of {}: {}", gateway, e);
        state.projection.invalidate(gateway).await;
    }
}
