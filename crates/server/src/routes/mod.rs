use axum::{
    Router,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{IntoMakeService, get},
};
use tower_http::cors::{Any, CorsLayer};

use crate::{DeploymentImpl, middleware as app_middleware};

pub mod activity;
pub mod agents;
pub mod artifacts;
pub mod config;
pub mod events;
pub mod health;
pub mod runs;
pub mod work_items;

/// Handler for the /metrics endpoint that exposes Prometheus metrics
async fn metrics_handler() -> impl IntoResponse {
    match maestro::metrics::export_metrics() {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to export metrics: {}", e),
        ),
    }
}

pub fn router(deployment: DeploymentImpl) -> IntoMakeService<Router> {
    let base_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics_handler))
        .merge(config::router())
        .merge(runs::router(&deployment))
        .merge(work_items::router())
        .merge(activity::router())
        .merge(artifacts::router())
        .merge(agents::router())
        .merge(events::router(&deployment))
        .with_state(deployment);

    Router::new()
        .nest("/api", base_routes)
        .layer(middleware::from_fn(app_middleware::request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .into_make_service()
}
