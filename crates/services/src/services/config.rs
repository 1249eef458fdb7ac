use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Engine configuration, persisted as JSON in the asset directory.
/// Every field has a default so a missing or sparse file still yields a
/// working config.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MaestroConfig {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    /// Write/verify rounds allowed per work item, counting the round
    /// that settles it.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Immediate retries per agent invocation on transient transport
    /// failures, on top of the first try.
    #[serde(default = "default_transport_retries")]
    pub transport_retries: usize,
    #[serde(default = "default_invoke_timeout_secs")]
    pub invoke_timeout_secs: u64,
    #[serde(default = "default_work_item_concurrency")]
    pub work_item_concurrency: usize,
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,
    #[serde(default = "default_fanout_tasks")]
    pub fanout_tasks: Vec<FanoutTask>,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// One independent artifact branch executed after the build/verify loop.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FanoutTask {
    pub kind: String,
    pub title: String,
    pub agent: String,
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Name of the environment variable holding the API key. The key
    /// itself never lands in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl GenerationConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_generation_base_url(),
            model: default_generation_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TrackerConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
}

impl TrackerConfig {
    pub fn is_configured(&self) -> bool {
        self.base_url.as_deref().is_some_and(|s| !s.is_empty())
            && self.api_token.as_deref().is_some_and(|s| !s.is_empty())
            && self.workspace.as_deref().is_some_and(|s| !s.is_empty())
    }
}

fn default_config_version() -> String {
    "v1".to_string()
}

fn default_retry_ceiling() -> u32 {
    5
}

fn default_transport_retries() -> usize {
    3
}

fn default_invoke_timeout_secs() -> u64 {
    120
}

fn default_work_item_concurrency() -> usize {
    3
}

fn default_fanout_concurrency() -> usize {
    3
}

fn default_generation_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_generation_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_fanout_tasks() -> Vec<FanoutTask> {
    vec![
        FanoutTask {
            kind: "architecture_diagram".to_string(),
            title: "Architecture Diagram".to_string(),
            agent: "vista".to_string(),
            instructions: "Produce a component architecture diagram in mermaid, \
                           covering every deliverable and how they connect."
                .to_string(),
        },
        FanoutTask {
            kind: "user_manual".to_string(),
            title: "User Manual".to_string(),
            agent: "docent".to_string(),
            instructions: "Write an end-user manual: setup, everyday usage, and a \
                           troubleshooting section."
                .to_string(),
        },
        FanoutTask {
            kind: "test_report".to_string(),
            title: "Test Report".to_string(),
            agent: "tally".to_string(),
            instructions: "Summarize verification results per deliverable, calling \
                           out anything that never passed."
                .to_string(),
        },
    ]
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            retry_ceiling: default_retry_ceiling(),
            transport_retries: default_transport_retries(),
            invoke_timeout_secs: default_invoke_timeout_secs(),
            work_item_concurrency: default_work_item_concurrency(),
            fanout_concurrency: default_fanout_concurrency(),
            fanout_tasks: default_fanout_tasks(),
            generation: GenerationConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

/// Load the config, falling back to defaults when the file is missing
/// or unreadable. A corrupt file is logged and replaced on next save
/// rather than taking the server down.
pub async fn load_config_from_file(path: &Path) -> MaestroConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "failed to parse config at {}: {}; using defaults",
                    path.display(),
                    e
                );
                MaestroConfig::default()
            }
        },
        Err(_) => MaestroConfig::default(),
    }
}

pub async fn save_config_to_file(config: &MaestroConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, contents).await?;
    Ok(())
}
