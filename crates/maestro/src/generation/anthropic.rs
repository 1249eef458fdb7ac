use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use services::services::config::GenerationConfig;

use super::{GenerationClient, GenerationError, GenerationOutput};
use crate::roster::AgentSpec;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Anthropic messages-API client. The API key is resolved from the
/// environment at construction; a missing key surfaces as a permanent
/// auth failure at call time so the server still boots without one.
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    api_key: Option<String>,
    api_key_env: String,
}

impl AnthropicClient {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            api_key: config.api_key(),
            api_key_env: config.api_key_env.clone(),
        }
    }
}

fn classify_status(status: u16, body: String) -> GenerationError {
    match status {
        400 => GenerationError::InvalidRequest(body),
        401 | 403 => GenerationError::AuthFailed(body),
        408 => GenerationError::Timeout,
        429 => GenerationError::RateLimited,
        529 => GenerationError::Unavailable("backend overloaded".to_string()),
        500..=599 => GenerationError::Unavailable(format!("status {}: {}", status, body)),
        other => GenerationError::Transport(format!("unexpected status {}: {}", other, body)),
    }
}

#[async_trait]
impl GenerationClient for AnthropicClient {
    async fn generate(
        &self,
        agent: &AgentSpec,
        prompt: &str,
    ) -> Result<GenerationOutput, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            GenerationError::AuthFailed(format!("{} is not set", self.api_key_env))
        })?;

        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: &agent.system_prompt,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout
                } else {
                    GenerationError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::BadResponse(e.to_string()))?;

        let content: String = body.content.into_iter().map(|b| b.text).collect();
        if content.is_empty() {
            return Err(GenerationError::BadResponse(
                "response carried no text content".to_string(),
            ));
        }
        Ok(GenerationOutput { content })
    }
}
