use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::activity::ActivityRecord;
use deployment::Deployment;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

pub async fn get_activity(
    Path(run_id): Path<Uuid>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<ActivityRecord>>>, ApiError> {
    let records = ActivityRecord::find_by_run(&deployment.db().pool, run_id).await?;
    Ok(ResponseJson(ApiResponse::success(records)))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/runs/{run_id}/activity", get(get_activity))
}
