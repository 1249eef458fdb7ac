use axum::{
    Json, Router,
    extract::State,
    response::Json as ResponseJson,
    routing::{get, put},
};
use deployment::Deployment;
use services::services::config::{MaestroConfig, save_config_to_file};
use utils::{assets::config_path, response::ApiResponse};

use crate::{DeploymentImpl, error::ApiError};

pub async fn get_config(
    State(deployment): State<DeploymentImpl>,
) -> ResponseJson<ApiResponse<MaestroConfig>> {
    let config = deployment.config().read().await.clone();
    ResponseJson(ApiResponse::success(config))
}

/// Replaces the engine configuration wholesale and persists it. Stage
/// knobs are re-read at each stage boundary, so runs in flight pick
/// them up at their next stage; generation and tracker settings bind
/// at startup and need a restart.
pub async fn update_config(
    State(deployment): State<DeploymentImpl>,
    Json(new_config): Json<MaestroConfig>,
) -> Result<ResponseJson<ApiResponse<MaestroConfig>>, ApiError> {
    if new_config.retry_ceiling == 0 {
        return Err(ApiError::BadRequest(
            "retry_ceiling must be at least 1".to_string(),
        ));
    }

    let mut config = deployment.config().write().await;
    *config = new_config;
    save_config_to_file(&config, &config_path()).await?;

    Ok(ResponseJson(ApiResponse::success(config.clone())))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/config", get(get_config).put(update_config))
}
