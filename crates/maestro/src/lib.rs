use db::models::{
    activity::ActivityError, artifact::ArtifactError, run::RunError, work_item::WorkItemError,
};
use thiserror::Error;

pub mod engine;
pub mod events;
pub mod generation;
pub mod invoker;
pub mod metrics;
pub mod roster;

#[derive(Debug, Error)]
pub enum MaestroError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    WorkItem(#[from] WorkItemError),
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    ArtifactStore(#[from] services::services::artifact_store::ArtifactStoreError),
    #[error("run {0} not found")]
    RunNotFound(uuid::Uuid),
    #[error("{0}")]
    Conflict(String),
    #[error("execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, MaestroError>;
