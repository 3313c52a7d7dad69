// HTTP surface: labelling requests, model updates and monitoring endpoints

pub mod error;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::core::errors::{LifecycleError, PipelineError};
use crate::core::types::{
    ModelUpdateEvent, ModelUpdateRequest, ProcessRequest, ProcessResponse, ServedModel,
};
use crate::middleware::{require_api_key, ApiKeyGate};
use crate::orchestration::PipelineOrchestrator;
use crate::services::model_manager::ModelLifecycleManager;
use crate::utils::{circuit_breakers_prometheus, Metrics};

pub use error::{ApiError, ErrorBody};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub models: Arc<ModelLifecycleManager>,
    pub gate: ApiKeyGate,
    pub metrics: Metrics,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let gated = Router::new()
        .route("/update_model/", post(update_model))
        .route("/rollback_model/", post(rollback_model))
        .route_layer(middleware::from_fn_with_state(
            state.gate.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/process-image/", post(process_image))
        .route("/api/webhook/model_update/", post(model_update_webhook))
        .merge(gated)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn root() -> &'static str {
    "Labelling Pipeline"
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.models.status(),
        "circuit_breakers": state.orchestrator.circuit_stats(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus()
            + &circuit_breakers_prometheus(&state.orchestrator.circuit_stats()),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let mut stats = serde_json::to_value(state.metrics.snapshot()).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })?;
    if let Value::Object(fields) = &mut stats {
        fields.insert(
            "circuit_breakers".to_string(),
            json!(state.orchestrator.circuit_stats()),
        );
    }
    Ok(Json(stats))
}

/// Label one image
///
/// # Request Format:
/// `{"file_name": "...", "image_path": "..."}`
///
/// # Response:
/// `ProcessResponse` on success, `ErrorBody` otherwise
async fn process_image(
    State(state): State<AppState>,
    payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let Json(request) =
        payload.map_err(|e| PipelineError::Validation(e.body_text()))?;
    let start_time = Instant::now();

    let result = state.orchestrator.process(&request).await?;

    info!(
        "Request for {} completed in {:.2}s",
        request.file_name,
        start_time.elapsed().as_secs_f64()
    );
    Ok(Json(ProcessResponse::new(request.file_name, result)))
}

/// Swap in the artifact at `s3_key`
#[instrument(skip(state, request), fields(s3_key = %request.s3_key))]
async fn update_model(
    State(state): State<AppState>,
    Json(request): Json<ModelUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    let served = swap_detached(&state.models, request.s3_key).await?;
    Ok(Json(json!({
        "status": "success",
        "message": "Model updated",
        "model": served.as_ref(),
    })))
}

/// Restore the previous artifact generation
async fn rollback_model(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let models = state.models.clone();
    let served = tokio::spawn(async move { models.rollback().await })
        .await
        .map_err(|e| LifecycleError::TaskJoinFailed(e.to_string()))??;
    Ok(Json(json!({
        "status": "success",
        "message": "Model rolled back",
        "model": served.as_ref(),
    })))
}

/// Model registry notification; only `ready` events trigger a swap
#[instrument(skip(state, event), fields(model = %event.model_name, version = event.version))]
async fn model_update_webhook(
    State(state): State<AppState>,
    Json(event): Json<ModelUpdateEvent>,
) -> Result<Json<Value>, ApiError> {
    if !event.is_ready() {
        info!("Ignoring model event with status '{}'", event.status);
        return Ok(Json(json!({
            "status": "ignored",
            "reason": format!("model status is '{}'", event.status),
        })));
    }

    let served = swap_detached(&state.models, event.source).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Model {} v{} deployed", event.model_name, event.version),
        "model": served.as_ref(),
    })))
}

/// Run a swap to completion even if the client disconnects
async fn swap_detached(
    models: &Arc<ModelLifecycleManager>,
    remote_key: String,
) -> Result<Arc<ServedModel>, ApiError> {
    let models = models.clone();
    let served = tokio::spawn(async move { models.swap(&remote_key).await })
        .await
        .map_err(|e| {
            warn!("Swap task failed to complete: {}", e);
            LifecycleError::TaskJoinFailed(e.to_string())
        })??;
    Ok(served)
}
