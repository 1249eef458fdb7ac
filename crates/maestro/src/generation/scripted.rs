use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{GenerationClient, GenerationError, GenerationOutput};
use crate::roster::AgentSpec;

#[derive(Debug)]
pub enum ScriptedReply {
    Content(String),
    Failure(GenerationError),
}

/// Offline generation client fed from per-agent reply queues. Used for
/// dry runs and for exercising the engine without a backend; an
/// exhausted queue is a permanent failure so an over-consuming caller
/// fails loudly instead of looping.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    replies: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_content(&self, agent: &str, content: impl Into<String>) {
        self.replies
            .lock()
            .await
            .entry(agent.to_string())
            .or_default()
            .push_back(ScriptedReply::Content(content.into()));
    }

    pub async fn push_failure(&self, agent: &str, error: GenerationError) {
        self.replies
            .lock()
            .await
            .entry(agent.to_string())
            .or_default()
            .push_back(ScriptedReply::Failure(error));
    }

    pub async fn remaining(&self, agent: &str) -> usize {
        self.replies
            .lock()
            .await
            .get(agent)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn generate(
        &self,
        agent: &AgentSpec,
        _prompt: &str,
    ) -> Result<GenerationOutput, GenerationError> {
        let mut replies = self.replies.lock().await;
        match replies.get_mut(&agent.name).and_then(|q| q.pop_front()) {
            Some(ScriptedReply::Content(content)) => Ok(GenerationOutput { content }),
            Some(ScriptedReply::Failure(error)) => Err(error),
            None => Err(GenerationError::InvalidRequest(format!(
                "no scripted reply left for agent '{}'",
                agent.name
            ))),
        }
    }
}
