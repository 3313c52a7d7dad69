// Main entry point for the labelling pipeline service

use labelling_pipeline::{
    api::{self, AppState},
    core::{config::ArtifactStoreKind, Config},
    middleware::ApiKeyGate,
    orchestration::PipelineOrchestrator,
    services::{
        model_manager::{loader_for, LifecycleSettings, ModelLifecycleManager, TokioSleeper},
        storage::{ArtifactStore, LocalArtifactStore, S3ArtifactStore},
    },
    utils::Metrics,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "labelling_pipeline={},tower_http=warn,ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== LABELLING PIPELINE ===");
    info!(
        "Config: detection={} recognition={} stage_timeout={}s chunk={}",
        config.services.detection_url,
        config.services.recognition_url,
        config.stage_timeout().as_secs(),
        config.services.recognition_chunk_size
    );

    let metrics = Metrics::new();

    // The served model must be loadable before any request is accepted
    let store: Arc<dyn ArtifactStore> = match config.storage.kind {
        ArtifactStoreKind::S3 => Arc::new(S3ArtifactStore::new(&config.storage)),
        ArtifactStoreKind::Local => Arc::new(LocalArtifactStore::new(config.storage.local_dir.clone())),
    };
    let models = Arc::new(
        ModelLifecycleManager::initialize(
            LifecycleSettings::from_config(&config.model, &config.storage),
            store,
            loader_for(config.model.loader),
            Arc::new(TokioSleeper),
            metrics.clone(),
        )
        .await
        .context("Served model failed validation")?,
    );

    info!("Initializing pipeline orchestrator...");
    let orchestrator = Arc::new(
        PipelineOrchestrator::from_config(config.clone(), models.clone(), metrics.clone()).await?,
    );

    let gate = ApiKeyGate::new(config.api_key.clone());
    if !gate.is_configured() {
        warn!("API_KEY is not set; model update routes will reject every call");
    }

    let app = api::router(AppState {
        orchestrator,
        models,
        gate,
        metrics,
    });

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server listening on http://{}", addr);
    info!("Endpoints:");
    info!("  GET  /                           - Service name");
    info!("  GET  /health                     - Health and served model");
    info!("  GET  /metrics                    - Prometheus metrics");
    info!("  GET  /stats                      - Detailed statistics");
    info!("  POST /process-image/             - Label one image");
    info!("  POST /update_model/              - Swap the detector model (access_token)");
    info!("  POST /rollback_model/            - Restore the previous model (access_token)");
    info!("  POST /api/webhook/model_update/  - Model registry notifications");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
