//! HTTP edge
//!
//! Thin axum layer over the [`LifecycleCoordinator`]: JSON in/out, CORS,
//! source-address rate limiting and audit entries. All lifecycle decisions
//! live in the coordinator; handlers only translate errors into status codes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;

use crate::admission::CreateStoreRequest;
use crate::coordinator::{CreatedStore, LifecycleCoordinator};
use crate::error::Error;
use crate::events::RequestMeta;
use crate::metrics::Metrics;
use crate::store::Store;

/// HTTP-facing error; every variant maps to one status code
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or invalid request
    #[error("{0}")]
    BadRequest(String),

    /// Unknown store id
    #[error("store not found")]
    NotFound,

    /// Create raced an existing id
    #[error("store already exists")]
    Conflict,

    /// Rate limit or quota exhausted
    #[error("{0}")]
    TooManyRequests(String),

    /// Anything the caller cannot fix
    #[error("internal error")]
    Internal(#[source] Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(message) => ApiError::BadRequest(message),
            Error::NotFound(_) => ApiError::NotFound,
            Error::Duplicate(_) => ApiError::Conflict,
            Error::QuotaExceeded => {
                ApiError::TooManyRequests("store quota exceeded".to_string())
            }
            other => ApiError::Internal(other),
        }
    }
}

/// Build the orchestrator router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// rate limiter and audit entries see real source addresses.
pub fn router(coordinator: Arc<LifecycleCoordinator>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/stores", get(list_stores).post(create_store))
        .route("/api/stores/{id}", get(get_store).delete(delete_store))
        .route("/api/metrics", get(metrics))
        .route("/api/activity", get(activity))
        .layer(middleware::from_fn_with_state(
            coordinator.clone(),
            rate_limit,
        ))
        .layer(middleware::from_fn(cors))
        .with_state(coordinator)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn list_stores(State(coordinator): State<Arc<LifecycleCoordinator>>) -> Json<Vec<Store>> {
    Json(coordinator.list_stores().await)
}

async fn get_store(
    State(coordinator): State<Arc<LifecycleCoordinator>>,
    Path(id): Path<String>,
) -> Result<Json<Store>, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::NotFound);
    }
    coordinator.get_store(id).map(Json).ok_or(ApiError::NotFound)
}

async fn create_store(
    State(coordinator): State<Arc<LifecycleCoordinator>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<CreateStoreRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedStore>), ApiError> {
    let meta = request_meta(addr, "POST", "/api/stores", &headers);
    let Ok(Json(request)) = payload else {
        coordinator
            .events()
            .audit("create_store", "", "rejected", "invalid request body", Some(&meta));
        return Err(ApiError::BadRequest("invalid request body".to_string()));
    };

    match coordinator.create_store(&request, &meta.ip).await {
        Ok(created) => {
            coordinator
                .events()
                .audit("create_store", &created.store.id, "accepted", "", Some(&meta));
            Ok((StatusCode::ACCEPTED, Json(created)))
        }
        Err(e) => {
            coordinator
                .events()
                .audit("create_store", "", "rejected", &e.to_string(), Some(&meta));
            Err(e.into())
        }
    }
}

async fn delete_store(
    State(coordinator): State<Arc<LifecycleCoordinator>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Store>), ApiError> {
    let id = id.trim().to_string();
    let meta = request_meta(addr, "DELETE", &format!("/api/stores/{id}"), &headers);

    match coordinator.delete_store(&id).await {
        Ok(store) => {
            coordinator
                .events()
                .audit("delete_store", &id, "accepted", "", Some(&meta));
            Ok((StatusCode::ACCEPTED, Json(store)))
        }
        Err(e) => {
            coordinator
                .events()
                .audit("delete_store", &id, "rejected", &e.to_string(), Some(&meta));
            Err(e.into())
        }
    }
}

async fn metrics(State(coordinator): State<Arc<LifecycleCoordinator>>) -> Json<Metrics> {
    Json(coordinator.metrics())
}

async fn activity(State(coordinator): State<Arc<LifecycleCoordinator>>) -> Json<serde_json::Value> {
    Json(json!({"events": coordinator.activity()}))
}

/// Allow any origin; answer preflights directly with 204.
async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(response.headers_mut());
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,DELETE,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type"),
    );
}

/// Sliding-window limit on write requests to the stores API
async fn rate_limit(
    State(coordinator): State<Arc<LifecycleCoordinator>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let is_write = method == Method::POST || method == Method::DELETE;
    if is_write && path.starts_with("/api/stores") {
        let ip = client_ip(&request);
        if !coordinator.rate_limiter().allow(&ip) {
            let meta = RequestMeta {
                ip,
                method: method.to_string(),
                path,
                user_agent: user_agent(request.headers()),
            };
            coordinator
                .events()
                .audit("rate_limit", "", "rejected", "rate limit exceeded", Some(&meta));
            return ApiError::TooManyRequests("rate limit exceeded".to_string())
                .into_response();
        }
    }
    next.run(request).await
}

fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default()
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn request_meta(addr: SocketAddr, method: &str, path: &str, headers: &HeaderMap) -> RequestMeta {
    RequestMeta {
        ip: addr.ip().to_string(),
        method: method.to_string(),
        path: path.to_string(),
        user_agent: user_agent(headers),
    }
}
