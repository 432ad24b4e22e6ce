use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiaryError, ApiaryResult};
use crate::manager::TenantManager;
use crate::metrics;
use crate::store::TenantStore;
use crate::tenant::TenantId;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TenantManager>,
    pub store: Arc<dyn TenantStore>,
}

/// Build the control-plane router.
///
/// API routes live under `/api/v1`; health and metrics stay at the root.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tenants", post(create_tenant).get(list_tenants))
        .route("/tenants/:id", get(get_tenant).delete(delete_tenant))
        .route("/tenants/:id/config/concurrency", put(update_concurrency))
        .route("/messages", get(list_messages))
        .route(
            "/messages/:id",
            post(create_message).get(get_message).delete(delete_message),
        )
        .route("/stats/tenants/:id/messages", get(message_stats));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateTenantRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct UpdateConcurrencyRequest {
    workers: usize,
}

#[derive(Debug, Deserialize)]
struct CreateMessageRequest {
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    tenant_id: Uuid,
    cursor: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    message: String,
}

impl IntoResponse for ApiaryError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiaryError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiaryError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiaryError::Store(_) | ApiaryError::Broker(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {self}");
        }

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

async fn create_tenant(
    State(state): State<AppState>,
    Json(request): Json<CreateTenantRequest>,
) -> ApiaryResult<impl IntoResponse> {
    let tenant = state.manager.create_tenant(&request.name).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

async fn list_tenants(
    State(state): State<AppState>,
) -> ApiaryResult<impl IntoResponse> {
    let tenants = state.manager.list_tenants().await?;
    Ok(Json(tenants))
}

async fn get_tenant(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiaryResult<impl IntoResponse> {
    let tenant = state.manager.get_tenant(TenantId(id)).await?;
    Ok(Json(tenant))
}

async fn delete_tenant(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiaryResult<impl IntoResponse> {
    state.manager.delete_tenant(TenantId(id)).await?;
    Ok(Json(SuccessResponse {
        message: "tenant deleted".to_string(),
    }))
}

async fn update_concurrency(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateConcurrencyRequest>,
) -> ApiaryResult<impl IntoResponse> {
    state
        .manager
        .update_concurrency(TenantId(id), request.workers)
        .await?;
    Ok(Json(SuccessResponse {
        message: "concurrency updated".to_string(),
    }))
}

async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiaryResult<impl IntoResponse> {
    let page = state
        .store
        .list_messages(
            TenantId(query.tenant_id),
            query.cursor.as_deref(),
            query.limit.unwrap_or(0),
        )
        .await?;
    Ok(Json(page))
}

async fn create_message(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<CreateMessageRequest>,
) -> ApiaryResult<impl IntoResponse> {
    // The tenant must exist; messages are written into its partition.
    state.manager.get_tenant(TenantId(tenant_id)).await?;
    let message = state
        .store
        .insert_message(TenantId(tenant_id), request.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiaryResult<impl IntoResponse> {
    let message = state.store.get_message(id).await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiaryResult<impl IntoResponse> {
    state.store.delete_message(id).await?;
    Ok(Json(SuccessResponse {
        message: "message deleted".to_string(),
    }))
}

async fn message_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiaryResult<impl IntoResponse> {
    let stats = state.store.message_stats(TenantId(id)).await?;
    Ok(Json(stats))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn metrics_endpoint() -> Response {
    match metrics::gather_metrics() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            tracing::error!("failed to gather metrics: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());

    let response = next.run(request).await;

    metrics::record_http_request(
        method.as_str(),
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}
