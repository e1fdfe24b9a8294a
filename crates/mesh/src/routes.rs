//! Mesh HTTP routes
//!
//! Binds every [`MeshService`] operation to a JSON endpoint. Errors are
//! always rendered as [`ErrorBody`] with a status derived from the kind.

use crate::service::MeshService;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use fleet_common::{Ack, Error, ErrorBody, ErrorKind, KeyValue, ServiceDescriptor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

// ============================================================================
// Errors
// ============================================================================

/// Error returned by handlers
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DuplicateName | ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::Validation | ErrorKind::InvalidQuery => StatusCode::BAD_REQUEST,
        ErrorKind::Provisioning | ErrorKind::Runtime | ErrorKind::Transport => {
            StatusCode::BAD_GATEWAY
        }
        ErrorKind::Teardown | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from(&self.0);
        let status = status_for(body.kind);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub tag: Option<String>,
}

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub service_id: String,
    pub services: usize,
}

// ============================================================================
// Router
// ============================================================================

/// Create the mesh router for `mesh`
pub fn mesh_router(mesh: Arc<MeshService>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Services
        .route("/services", post(register_service_handler))
        // Static segment wins over `:name`; "search" is a reserved service name
        .route("/services/search", get(search_services_handler))
        .route("/services/:name", get(get_services_handler))
        .route("/services/:name/:id", delete(deregister_service_handler))
        .route("/discovery/:name", get(discover_service_handler))
        // Key-value
        .route("/kv", put(set_key_value_handler))
        .route("/kv/:key", get(get_key_value_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(mesh)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(mesh): State<Arc<MeshService>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        name: mesh.name().to_string(),
        service_id: mesh.service_id().to_string(),
        services: mesh.service_count(),
    })
}

async fn register_service_handler(
    State(mesh): State<Arc<MeshService>>,
    payload: std::result::Result<Json<ServiceDescriptor>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ServiceDescriptor>)> {
    let Json(descriptor) = payload?;
    let registered = mesh.register_service(descriptor)?;
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn search_services_handler(
    State(mesh): State<Arc<MeshService>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<ServiceDescriptor>>> {
    let tag = query
        .tag
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::InvalidQuery("search requires a tag".to_string()))?;
    Ok(Json(mesh.search_services(&tag)?))
}

async fn get_services_handler(
    State(mesh): State<Arc<MeshService>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<ServiceDescriptor>>> {
    Ok(Json(mesh.get_services(&name)?))
}

async fn deregister_service_handler(
    State(mesh): State<Arc<MeshService>>,
    Path((name, id)): Path<(String, String)>,
) -> Json<Ack> {
    Json(mesh.deregister_service(&name, &id))
}

async fn discover_service_handler(
    State(mesh): State<Arc<MeshService>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<ServiceDescriptor>>> {
    Ok(Json(mesh.discover_service(&name)?))
}

async fn set_key_value_handler(
    State(mesh): State<Arc<MeshService>>,
    payload: std::result::Result<Json<KeyValue>, JsonRejection>,
) -> ApiResult<Json<Ack>> {
    let Json(kv) = payload?;
    Ok(Json(mesh.set_key_value(&kv.key, kv.value)?))
}

async fn get_key_value_handler(
    State(mesh): State<Arc<MeshService>>,
    Path(key): Path<String>,
) -> ApiResult<Json<KeyValue>> {
    let value = mesh.get_key_value(&key)?;
    Ok(Json(KeyValue { key, value }))
}
