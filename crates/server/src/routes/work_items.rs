use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::work_item::WorkItem;
use deployment::Deployment;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

pub async fn get_work_items(
    Path(run_id): Path<Uuid>,
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<Vec<WorkItem>>>, ApiError> {
    let items = WorkItem::find_by_run(&deployment.db().pool, run_id).await?;
    Ok(ResponseJson(ApiResponse::success(items)))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/runs/{run_id}/work_items", get(get_work_items))
}
