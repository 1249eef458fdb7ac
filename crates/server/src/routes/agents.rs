use axum::{Router, extract::State, response::Json as ResponseJson, routing::get};
use deployment::Deployment;
use maestro::roster::AgentSpec;
use utils::response::ApiResponse;

use crate::DeploymentImpl;

pub async fn get_agents(
    State(deployment): State<DeploymentImpl>,
) -> ResponseJson<ApiResponse<Vec<AgentSpec>>> {
    ResponseJson(ApiResponse::success(deployment.roster().all().to_vec()))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/agents", get(get_agents))
}
