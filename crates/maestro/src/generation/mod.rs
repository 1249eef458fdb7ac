use async_trait::async_trait;
use thiserror::Error;

use crate::roster::AgentSpec;

pub mod anthropic;
pub mod scripted;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request rejected: {0}")]
    InvalidRequest(String),
    #[error("generation authentication failed: {0}")]
    AuthFailed(String),
    #[error("generation rate limited")]
    RateLimited,
    #[error("generation request timed out")]
    Timeout,
    #[error("generation backend unavailable: {0}")]
    Unavailable(String),
    #[error("generation transport error: {0}")]
    Transport(String),
    #[error("malformed generation response: {0}")]
    BadResponse(String),
}

impl GenerationError {
    /// Errors worth an immediate retry. Unavailable backends are
    /// included so short outages ride out inside a single invocation.
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimited
                | GenerationError::Timeout
                | GenerationError::Unavailable(_)
                | GenerationError::Transport(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub content: String,
}

/// One text-generation call against a backend. Implementations map
/// backend-specific failures onto [`GenerationError`] so the invoker
/// can classify them uniformly.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(
        &self,
        agent: &AgentSpec,
        prompt: &str,
    ) -> Result<GenerationOutput, GenerationError>;
}
