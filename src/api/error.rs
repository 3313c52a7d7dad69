// Error responses: `{error, stage?, detail}` with a status per failure kind

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::core::errors::{LifecycleError, PipelineError};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<&'static str>,
    pub detail: String,
}

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    Lifecycle(LifecycleError),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        ApiError::Lifecycle(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Pipeline(e) => match e {
                PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
                PipelineError::RecordNotFound { .. } => StatusCode::NOT_FOUND,
                PipelineError::NoRegionsDetected | PipelineError::EmptyRecognizedText => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                PipelineError::StageFailed { source, .. } if source.is_timeout() => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                PipelineError::StageFailed { .. } => StatusCode::BAD_GATEWAY,
            },
            ApiError::Lifecycle(e) => match e {
                LifecycleError::InvalidKey(_) => StatusCode::BAD_REQUEST,
                LifecycleError::SwapInProgress | LifecycleError::NoBackupAvailable => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Pipeline(e) => ErrorBody {
                error: e.tag(),
                stage: e.stage().map(|s| s.as_str()),
                detail: e.to_string(),
            },
            ApiError::Lifecycle(e) => ErrorBody {
                error: lifecycle_tag(e),
                stage: None,
                detail: e.to_string(),
            },
        }
    }
}

fn lifecycle_tag(err: &LifecycleError) -> &'static str {
    match err {
        LifecycleError::InvalidKey(_) => "validation_error",
        LifecycleError::SwapExhausted { .. } => "swap_exhausted",
        LifecycleError::NoBackupAvailable => "no_backup_available",
        LifecycleError::SwapInProgress => "swap_in_progress",
        LifecycleError::ModelNotLoadable { .. } => "model_not_loadable",
        LifecycleError::Io(_) => "model_io_error",
        LifecycleError::TaskJoinFailed(_) => "lifecycle_task_failed",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
