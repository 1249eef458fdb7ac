use std::{sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use serde_json::Value;
use thiserror::Error;

use crate::{
    generation::{GenerationClient, GenerationError},
    metrics,
    roster::AgentRoster,
};

/// How an invocation ultimately failed, after timeouts and immediate
/// retries have been applied.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("transient failure from {agent}: {reason}")]
    Transient { agent: String, reason: String },
    #[error("permanent failure from {agent}: {reason}")]
    Permanent { agent: String, reason: String },
    #[error("dependency unavailable for {agent}: {reason}")]
    DependencyUnavailable { agent: String, reason: String },
}

impl InvokeError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, InvokeError::Permanent { .. })
    }

    pub fn agent(&self) -> &str {
        match self {
            InvokeError::Transient { agent, .. }
            | InvokeError::Permanent { agent, .. }
            | InvokeError::DependencyUnavailable { agent, .. } => agent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExpectedArtifact {
    pub kind: String,
    pub title: String,
}

/// What an agent is asked to do: a description, optional structured
/// input, and optionally the artifact the output should be captured as.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub description: String,
    pub requirements: Option<Value>,
    pub expected_artifact: Option<ExpectedArtifact>,
}

impl AgentTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            requirements: None,
            expected_artifact: None,
        }
    }

    pub fn with_requirements(mut self, requirements: Value) -> Self {
        self.requirements = Some(requirements);
        self
    }

    pub fn with_artifact(mut self, kind: impl Into<String>, title: impl Into<String>) -> Self {
        self.expected_artifact = Some(ExpectedArtifact {
            kind: kind.into(),
            title: title.into(),
        });
        self
    }
}

/// Labeled context segments carried into a prompt: prior artifacts,
/// verification feedback, anything the current step builds on.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    segments: Vec<(String, String)>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, content: impl Into<String>) {
        self.segments.push((label.into(), content.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn render(&self) -> String {
        self.segments
            .iter()
            .map(|(label, content)| format!("## {}\n{}\n", label, content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub kind: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub content: String,
    pub artifacts: Vec<GeneratedArtifact>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Immediate retries after the first attempt.
    pub max_times: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_times: 3,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Uniform doorway to every agent call: roster lookup, per-attempt
/// timeout, immediate backoff retries for retryable failures, and
/// classification of whatever is left into [`InvokeError`].
pub struct AgentInvoker {
    roster: Arc<AgentRoster>,
    client: Arc<dyn GenerationClient>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl AgentInvoker {
    pub fn new(roster: Arc<AgentRoster>, client: Arc<dyn GenerationClient>) -> Self {
        Self {
            roster,
            client,
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn invoke(
        &self,
        agent_name: &str,
        task: &AgentTask,
        context: &TaskContext,
    ) -> Result<AgentOutput, InvokeError> {
        let agent = self
            .roster
            .get(agent_name)
            .ok_or_else(|| InvokeError::Permanent {
                agent: agent_name.to_string(),
                reason: format!("unknown agent '{}'", agent_name),
            })?;

        let prompt = build_prompt(task, context);
        let started = std::time::Instant::now();

        let result = (|| async {
            match tokio::time::timeout(self.timeout, self.client.generate(agent, &prompt)).await {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout),
            }
        })
        .retry(
            &ExponentialBuilder::default()
                .with_min_delay(self.retry.min_delay)
                .with_max_delay(self.retry.max_delay)
                .with_max_times(self.retry.max_times)
                .with_jitter(),
        )
        .when(|e: &GenerationError| e.should_retry())
        .notify(|err, dur| {
            tracing::warn!(
                "[INVOKER] {} call failed, retrying after {:.2}s: {}",
                agent_name,
                dur.as_secs_f64(),
                err
            );
        })
        .await;

        metrics::record_invocation(agent_name, result.is_ok(), started.elapsed());

        let output = result.map_err(|e| classify(agent_name, e))?;
        let artifacts = match &task.expected_artifact {
            Some(expected) => vec![GeneratedArtifact {
                kind: expected.kind.clone(),
                title: expected.title.clone(),
                content: output.content.clone(),
            }],
            None => Vec::new(),
        };
        Ok(AgentOutput {
            content: output.content,
            artifacts,
        })
    }
}

fn classify(agent: &str, error: GenerationError) -> InvokeError {
    let agent = agent.to_string();
    let reason = error.to_string();
    match error {
        GenerationError::RateLimited | GenerationError::Timeout | GenerationError::Transport(_) => {
            InvokeError::Transient { agent, reason }
        }
        GenerationError::Unavailable(_) => InvokeError::DependencyUnavailable { agent, reason },
        GenerationError::InvalidRequest(_)
        | GenerationError::AuthFailed(_)
        | GenerationError::BadResponse(_) => InvokeError::Permanent { agent, reason },
    }
}

fn build_prompt(task: &AgentTask, context: &TaskContext) -> String {
    let mut prompt = String::new();
    if let Some(requirements) = &task.requirements {
        prompt.push_str("## Task Input\n```json\n");
        prompt.push_str(
            &serde_json::to_string_pretty(requirements).unwrap_or_else(|_| requirements.to_string()),
        );
        prompt.push_str("\n```\n\n");
    }
    if !context.is_empty() {
        prompt.push_str(&context.render());
        prompt.push('\n');
    }
    prompt.push_str("## Task\n");
    prompt.push_str(&task.description);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::scripted::ScriptedClient;
    use crate::roster::AgentRoster;

    fn fast_invoker(client: Arc<ScriptedClient>) -> AgentInvoker {
        AgentInvoker::new(Arc::new(AgentRoster::builtin()), client).with_retry_policy(RetryPolicy {
            max_times: 2,
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        })
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_failure("mason", GenerationError::RateLimited)
            .await;
        client
            .push_failure("mason", GenerationError::Transport("reset".to_string()))
            .await;
        client.push_content("mason", "done").await;

        let invoker = fast_invoker(client.clone());
        let output = invoker
            .invoke("mason", &AgentTask::new("build it"), &TaskContext::new())
            .await
            .unwrap();
        assert_eq!(output.content, "done");
        assert_eq!(client.remaining("mason").await, 0);
    }

    #[tokio::test]
    async fn retries_exhaust_into_a_transient_error() {
        let client = Arc::new(ScriptedClient::new());
        for _ in 0..3 {
            client
                .push_failure("mason", GenerationError::RateLimited)
                .await;
        }

        let invoker = fast_invoker(client.clone());
        let err = invoker
            .invoke("mason", &AgentTask::new("build it"), &TaskContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Transient { .. }));
        assert_eq!(err.agent(), "mason");
    }

    #[tokio::test]
    async fn permanent_failures_do_not_retry() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_failure(
                "mason",
                GenerationError::InvalidRequest("bad task".to_string()),
            )
            .await;
        client.push_content("mason", "never reached").await;

        let invoker = fast_invoker(client.clone());
        let err = invoker
            .invoke("mason", &AgentTask::new("build it"), &TaskContext::new())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(client.remaining("mason").await, 1);
    }

    #[tokio::test]
    async fn unavailable_backend_classifies_as_dependency_failure() {
        let client = Arc::new(ScriptedClient::new());
        for _ in 0..3 {
            client
                .push_failure(
                    "mason",
                    GenerationError::Unavailable("overloaded".to_string()),
                )
                .await;
        }

        let invoker = fast_invoker(client);
        let err = invoker
            .invoke("mason", &AgentTask::new("build it"), &TaskContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::DependencyUnavailable { .. }));
    }

    #[tokio::test]
    async fn unknown_agent_is_permanent() {
        let client = Arc::new(ScriptedClient::new());
        let invoker = fast_invoker(client);
        let err = invoker
            .invoke("nobody", &AgentTask::new("?"), &TaskContext::new())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.agent(), "nobody");
    }

    #[tokio::test]
    async fn expected_artifact_wraps_the_output() {
        let client = Arc::new(ScriptedClient::new());
        client.push_content("scribe", "# Requirements").await;

        let invoker = fast_invoker(client);
        let task = AgentTask::new("write the brief").with_artifact("requirements", "Requirements");
        let output = invoker
            .invoke("scribe", &task, &TaskContext::new())
            .await
            .unwrap();
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(output.artifacts[0].kind, "requirements");
        assert_eq!(output.artifacts[0].content, "# Requirements");
    }

    #[test]
    fn prompt_layers_input_context_and_task() {
        let mut context = TaskContext::new();
        context.push("Requirements Brief", "the brief");
        let task = AgentTask::new("decompose")
            .with_requirements(serde_json::json!({ "project_name": "todo" }));

        let prompt = build_prompt(&task, &context);
        let input_at = prompt.find("## Task Input").unwrap();
        let context_at = prompt.find("## Requirements Brief").unwrap();
        let task_at = prompt.find("## Task\ndecompose").unwrap();
        assert!(input_at < context_at && context_at < task_at);
    }
}
