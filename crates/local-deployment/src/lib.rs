use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use maestro::{
    engine::RunEngine,
    events::EventHub,
    generation::{GenerationClient, anthropic::AnthropicClient},
    invoker::{AgentInvoker, RetryPolicy},
    roster::AgentRoster,
};
use services::services::{
    artifact_store::ArtifactStore,
    config::{MaestroConfig, load_config_from_file, save_config_to_file},
    tracker::TrackerService,
};
use tokio::sync::RwLock;
use utils::assets::{artifact_dir, config_path};

/// Single-process deployment: SQLite in the asset directory, artifacts
/// on the local filesystem, generation against the Anthropic API.
#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<RwLock<MaestroConfig>>,
    db: DBService,
    events: Arc<EventHub>,
    engine: Arc<RunEngine>,
    roster: Arc<AgentRoster>,
    artifacts: ArtifactStore,
    tracker: TrackerService,
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        let raw_config = load_config_from_file(&config_path()).await;
        // Write back so newly introduced defaults land in the file.
        save_config_to_file(&raw_config, &config_path()).await?;

        let roster = Arc::new(AgentRoster::builtin());
        let client: Arc<dyn GenerationClient> =
            Arc::new(AnthropicClient::new(&raw_config.generation));
        let invoker = Arc::new(
            AgentInvoker::new(roster.clone(), client)
                .with_timeout(Duration::from_secs(raw_config.invoke_timeout_secs))
                .with_retry_policy(RetryPolicy {
                    max_times: raw_config.transport_retries,
                    ..RetryPolicy::default()
                }),
        );

        let db = DBService::new().await?;
        let events = Arc::new(EventHub::new());
        let artifacts = ArtifactStore::new(artifact_dir());
        let tracker = TrackerService::new(raw_config.tracker.clone());
        let config = Arc::new(RwLock::new(raw_config));

        let engine = Arc::new(RunEngine::new(
            db.pool.clone(),
            events.clone(),
            roster.clone(),
            invoker,
            artifacts.clone(),
            tracker.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            db,
            events,
            engine,
            roster,
            artifacts,
            tracker,
        })
    }

    fn config(&self) -> &Arc<RwLock<MaestroConfig>> {
        &self.config
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    fn engine(&self) -> &Arc<RunEngine> {
        &self.engine
    }

    fn roster(&self) -> &Arc<AgentRoster> {
        &self.roster
    }

    fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    fn tracker(&self) -> &TrackerService {
        &self.tracker
    }
}
