use axum::{
    Json, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::run::{CreateRun, Run};
use deployment::Deployment;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

pub async fn get_runs(
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<Run>>>, ApiError> {
    let runs = Run::list(&deployment.db().pool).await?;
    Ok(ResponseJson(ApiResponse::success(runs)))
}

pub async fn get_run(
    Path(run_id): Path<Uuid>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    let run = Run::find_by_id(&deployment.db().pool, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Run not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(run)))
}

/// Creates the run and immediately hands it to the engine; the response
/// carries the freshly created row while the stages execute in the
/// background.
pub async fn create_run(
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<CreateRun>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    if payload.project_name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Project name cannot be empty".to_string(),
        ));
    }

    let run = deployment.engine().create_run(&payload).await?;
    deployment.engine().spawn(run.id).await?;

    Ok(ResponseJson(ApiResponse::success(run)))
}

pub async fn cancel_run(
    Path(run_id): Path<Uuid>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    let run = deployment.engine().cancel(run_id).await?;
    Ok(ResponseJson(ApiResponse::success(run)))
}

pub async fn archive_run(
    Path(run_id): Path<Uuid>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Run>>, ApiError> {
    let run = deployment.engine().archive(run_id).await?;
    Ok(ResponseJson(ApiResponse::success(run)))
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/runs", get(get_runs).post(create_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/runs/{run_id}/archive", post(archive_run))
}
