use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::artifact::Artifact;
use deployment::Deployment;
use serde::Serialize;
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct ArtifactContent {
    pub artifact: Artifact,
    pub content: String,
}

pub async fn get_artifacts(
    Path(run_id): Path<Uuid>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<Artifact>>>, ApiError> {
    let artifacts = Artifact::find_by_run(&deployment.db().pool, run_id).await?;
    Ok(ResponseJson(ApiResponse::success(artifacts)))
}

/// Returns the artifact row together with the document text read back
/// from the artifact store.
pub async fn get_artifact_content(
    Path(artifact_id): Path<Uuid>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<ArtifactContent>>, ApiError> {
    let artifact = Artifact::find_by_id(&deployment.db().pool, artifact_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Artifact not found".to_string()))?;
    let content = deployment.artifacts().read(&artifact.path).await?;
    Ok(ResponseJson(ApiResponse::success(ArtifactContent {
        artifact,
        content,
    })))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new()
        .route("/runs/{run_id}/artifacts", get(get_artifacts))
        .route("/artifacts/{artifact_id}/content", get(get_artifact_content))
}
