use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::{
    activity::ActivityError, artifact::ArtifactError, run::RunError, work_item::WorkItemError,
};
use deployment::DeploymentError;
use maestro::MaestroError;
use services::services::{artifact_store::ArtifactStoreError, config::ConfigError};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error, ts_rs::TS)]
#[ts(type = "string")]
pub enum ApiError {
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Database(e) => ApiError::Database(e),
            RunError::NotFound => ApiError::NotFound("Run not found".into()),
            RunError::InvalidTransition(msg) => ApiError::Conflict(msg),
        }
    }
}

impl From<WorkItemError> for ApiError {
    fn from(err: WorkItemError) -> Self {
        match err {
            WorkItemError::Database(e) => ApiError::Database(e),
            WorkItemError::NotFound => ApiError::NotFound("Work item not found".into()),
        }
    }
}

impl From<ActivityError> for ApiError {
    fn from(err: ActivityError) -> Self {
        match err {
            ActivityError::Database(e) => ApiError::Database(e),
        }
    }
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::Database(e) => ApiError::Database(e),
            ArtifactError::NotFound => ApiError::NotFound("Artifact not found".into()),
        }
    }
}

impl From<ArtifactStoreError> for ApiError {
    fn from(err: ArtifactStoreError) -> Self {
        match err {
            ArtifactStoreError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ApiError::NotFound("Artifact content not found".into())
            }
            ArtifactStoreError::Io(e) => ApiError::Io(e),
            ArtifactStoreError::InvalidPath(msg) => ApiError::BadRequest(msg),
        }
    }
}

impl From<MaestroError> for ApiError {
    fn from(err: MaestroError) -> Self {
        match err {
            MaestroError::Run(e) => e.into(),
            MaestroError::WorkItem(e) => e.into(),
            MaestroError::Activity(e) => e.into(),
            MaestroError::Artifact(e) => e.into(),
            MaestroError::ArtifactStore(e) => e.into(),
            MaestroError::RunNotFound(_) => ApiError::NotFound("Run not found".into()),
            MaestroError::Conflict(msg) => ApiError::Conflict(msg),
            MaestroError::Execution(msg) => ApiError::InternalError(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::Deployment(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeploymentError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigError"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IoError"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "ConflictError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        let error_message = match &self {
            ApiError::Conflict(msg) => msg.clone(),
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::NotFound(msg) => msg.clone(),
            ApiError::InternalError(msg) => msg.clone(),
            _ => format!("{}: {}", error_type, self),
        };
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
