use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use db::models::{run::Run, work_item::WorkItem};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::services::config::TrackerConfig;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker integration is not configured")]
    NotConfigured,
    #[error("tracker authentication failed")]
    AuthFailed,
    #[error("tracker rate limited")]
    RateLimited,
    #[error("tracker api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("tracker request failed: {0}")]
    Request(String),
}

impl TrackerError {
    pub fn should_retry(&self) -> bool {
        matches!(self, TrackerError::RateLimited | TrackerError::Request(_))
    }
}

#[derive(Debug, Serialize)]
struct CreateProjectRequest<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateIssueRequest<'a> {
    name: &'a str,
    description: &'a str,
    priority: String,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    id: String,
}

/// Mirrors planned work items into an external issue tracker. The
/// engine treats every error here as non-fatal; a run proceeds whether
/// or not registration lands.
#[derive(Debug, Clone)]
pub struct TrackerService {
    client: reqwest::Client,
    config: TrackerConfig,
}

impl TrackerService {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_configured()
    }

    fn retry_policy() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(2)
            .with_jitter()
    }

    /// Create a tracker project for the run and one issue per work
    /// item, returning `(work_item_id, issue_id)` pairs for external
    /// reference bookkeeping.
    pub async fn register_work_items(
        &self,
        run: &Run,
        items: &[WorkItem],
    ) -> Result<Vec<(Uuid, String)>, TrackerError> {
        if !self.is_enabled() {
            return Err(TrackerError::NotConfigured);
        }

        let project = (|| async { self.create_project(run).await })
            .retry(&Self::retry_policy())
            .when(|e: &TrackerError| e.should_retry())
            .notify(|err, dur| {
                tracing::warn!(
                    "tracker project creation failed, retrying after {:.2}s: {}",
                    dur.as_secs_f64(),
                    err
                );
            })
            .await?;

        let mut refs = Vec::with_capacity(items.len());
        for item in items {
            let issue = (|| async { self.create_issue(&project.id, item).await })
                .retry(&Self::retry_policy())
                .when(|e: &TrackerError| e.should_retry())
                .notify(|err, dur| {
                    tracing::warn!(
                        "tracker issue creation failed, retrying after {:.2}s: {}",
                        dur.as_secs_f64(),
                        err
                    );
                })
                .await?;
            refs.push((item.id, issue.id));
        }
        Ok(refs)
    }

    async fn create_project(&self, run: &Run) -> Result<ProjectResponse, TrackerError> {
        let url = format!(
            "{}/api/v1/workspaces/{}/projects",
            self.base_url()?,
            self.workspace()?
        );
        let response = self
            .client
            .post(&url)
            .header("X-API-Key", self.api_token()?)
            .json(&CreateProjectRequest {
                name: &run.project_name,
                description: &run.description,
            })
            .send()
            .await
            .map_err(|e| TrackerError::Request(e.to_string()))?;

        Self::parse_response(response).await
    }

    async fn create_issue(
        &self,
        project_id: &str,
        item: &WorkItem,
    ) -> Result<IssueResponse, TrackerError> {
        let url = format!(
            "{}/api/v1/workspaces/{}/projects/{}/issues",
            self.base_url()?,
            self.workspace()?,
            project_id
        );
        let response = self
            .client
            .post(&url)
            .header("X-API-Key", self.api_token()?)
            .json(&CreateIssueRequest {
                name: &item.title,
                description: &item.description,
                priority: item.priority.to_string(),
            })
            .send()
            .await
            .map_err(|e| TrackerError::Request(e.to_string()))?;

        Self::parse_response(response).await
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TrackerError> {
        let status = response.status();
        match status.as_u16() {
            401 | 403 => Err(TrackerError::AuthFailed),
            429 => Err(TrackerError::RateLimited),
            _ if status.is_success() => response
                .json()
                .await
                .map_err(|e| TrackerError::Request(e.to_string())),
            code => {
                let body = response.text().await.unwrap_or_default();
                Err(TrackerError::Api { status: code, body })
            }
        }
    }

    fn base_url(&self) -> Result<&str, TrackerError> {
        self.config
            .base_url
            .as_deref()
            .map(|s| s.trim_end_matches('/'))
            .ok_or(TrackerError::NotConfigured)
    }

    fn workspace(&self) -> Result<&str, TrackerError> {
        self.config
            .workspace
            .as_deref()
            .ok_or(TrackerError::NotConfigured)
    }

    fn api_token(&self) -> Result<&str, TrackerError> {
        self.config
            .api_token
            .as_deref()
            .ok_or(TrackerError::NotConfigured)
    }
}
