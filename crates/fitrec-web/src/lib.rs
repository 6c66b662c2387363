//! Axum JSON API over the FitRec review cache and catalog maintenance engine.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fitrec_core::{ProductId, SearchResult};
use fitrec_storage::CatalogStore;
use fitrec_sync::{CacheState, Engine, MergeError, RefreshError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "fitrec-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Admin routes answer 403 when unset.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(engine: Engine, admin_token: Option<String>) -> Self {
        Self { engine, admin_token }
    }
}

#[derive(Debug, Deserialize)]
struct StoreReviewsBody {
    query: String,
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct MergeBody {
    keep_id: ProductId,
    delete_id: ProductId,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/products/{id}/reviews",
            get(cached_reviews_handler).post(store_reviews_handler),
        )
        .route("/products/{id}/cache", get(cache_status_handler))
        .route("/admin/duplicates", get(duplicates_handler))
        .route("/admin/merge", post(merge_handler))
        .route("/admin/refresh", post(sweep_handler))
        .route("/admin/refresh/{id}", post(refresh_product_handler))
        .route("/admin/cache/{id}", axum::routing::delete(clear_cache_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn cached_reviews_handler(State(state): State<Arc<AppState>>, Path(id): Path<ProductId>) -> Response {
    match state.engine.get_cached_reviews(id).await {
        Some(cached) => Json(cached).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "status": "absent" }))).into_response(),
    }
}

async fn store_reviews_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ProductId>,
    Json(body): Json<StoreReviewsBody>,
) -> Response {
    if let Err(resp) = require_product(&state, id).await {
        return resp;
    }
    match state.engine.store_reviews(id, &body.query, &body.results).await {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn cache_status_handler(State(state): State<Arc<AppState>>, Path(id): Path<ProductId>) -> Response {
    match state.engine.cache().status(id).await {
        Ok(status) if status.state == CacheState::Absent => {
            (StatusCode::NOT_FOUND, Json(status)).into_response()
        }
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err),
    }
}

async fn duplicates_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.engine.find_duplicates().await {
        Ok(pairs) => Json(json!({ "count": pairs.len(), "pairs": pairs })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn merge_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<MergeBody>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.engine.merge_products(body.keep_id, body.delete_id).await {
        Ok(report) => Json(json!({
            "success": true,
            "keep_id": report.keep_id,
            "delete_id": report.delete_id,
            "repointed": report.repointed,
        }))
        .into_response(),
        Err(err) => {
            let status = match &err {
                MergeError::SameProduct(_) => StatusCode::BAD_REQUEST,
                MergeError::ProductNotFound(_) => StatusCode::NOT_FOUND,
                MergeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({ "success": false, "error": err.to_string() }))).into_response()
        }
    }
}

/// Starts a sweep in the background; the sweep itself can run for minutes.
async fn sweep_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let engine = state.engine.clone();
    tokio::spawn(async move {
        match engine.run_sweep().await {
            Ok(summary) => info!(
                run_id = %summary.run_id,
                refreshed = summary.refreshed,
                errored = summary.errored,
                "admin sweep complete"
            ),
            Err(err) => error!(error = %err, "admin sweep could not start"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
}

async fn refresh_product_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ProductId>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.engine.scheduler().refresh_product(id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            let status = match &err {
                RefreshError::ProductNotFound(_) | RefreshError::BrandNotFound { .. } => StatusCode::NOT_FOUND,
                RefreshError::SearchFailed { .. } => StatusCode::BAD_GATEWAY,
                RefreshError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({ "error": err.to_string() }))).into_response()
        }
    }
}

async fn clear_cache_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<ProductId>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.engine.cache().clear(id).await {
        Ok(removed) => Json(json!({ "product_id": id, "removed": removed })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn require_product(state: &AppState, id: ProductId) -> Result<(), Response> {
    match state.engine.catalog().get_product(id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err((StatusCode::NOT_FOUND, Json(json!({ "error": format!("product {id} not found") }))).into_response()),
        Err(err) => Err(server_error(err)),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err((StatusCode::FORBIDDEN, Json(json!({ "error": "admin api disabled" }))).into_response());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if presented == Some(expected) {
        Ok(())
    } else {
        warn!("rejected admin request");
        Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid admin token" }))).into_response())
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
