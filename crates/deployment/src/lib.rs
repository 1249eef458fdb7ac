use std::sync::Arc;

use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use db::DBService;
use maestro::{MaestroError, engine::RunEngine, events::EventHub, roster::AgentRoster};
use services::services::{
    artifact_store::ArtifactStore,
    config::{ConfigError, MaestroConfig},
    tracker::TrackerService,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Maestro(#[from] MaestroError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

/// Wiring seam between the HTTP layer and the engine. The server is
/// generic over this trait; a deployment decides where state lives and
/// which generation backend the engine talks to.
#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn config(&self) -> &Arc<RwLock<MaestroConfig>>;

    fn db(&self) -> &DBService;

    fn events(&self) -> &Arc<EventHub>;

    fn engine(&self) -> &Arc<RunEngine>;

    fn roster(&self) -> &Arc<AgentRoster>;

    fn artifacts(&self) -> &ArtifactStore;

    fn tracker(&self) -> &TrackerService;

    /// Respawn drivers for runs left unfinished by the previous
    /// process, call at startup.
    async fn resume_active_runs(&self) -> Result<usize, DeploymentError> {
        let resumed = self.engine().resume_active_runs().await?;
        if resumed == 0 {
            tracing::debug!("no unfinished runs to resume");
        }
        Ok(resumed)
    }
}
