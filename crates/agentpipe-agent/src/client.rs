//! Claude API client plus the `AgentRuntime` adapter that drives it.
//!
//! Uses the secrecy crate to protect the API key in memory.

use std::time::Duration;

use agentpipe_core::agent_runtime::{
    AgentRequest, AgentResponse, AgentRuntime, OutputSink, RuntimeCapabilities, RuntimeValidation,
};
use agentpipe_core::model::TokenUsage;
use agentpipe_core::runner::AbortHandle;
use agentpipe_core::{Error, Result};
use anyhow::Context;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Clone)]
pub struct ClaudeClient {
    api_key: SecretString,
    base_url: String,
    client: reqwest::Client,
}

impl ClaudeClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_config(api_key, ClaudeClientConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: ClaudeClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .expect("failed to build HTTP client");

        Self {
            api_key: SecretString::new(api_key.into()),
            base_url: config.base_url,
            client,
        }
    }

    pub async fn create_message(&self, request: CreateMessageRequest) -> anyhow::Result<MessageResponse> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("sending request to the Claude API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error ({status}): {error}");
        }

        response.json().await.context("decoding Claude API response")
    }
}

pub struct ClaudeClientConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ClaudeClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateMessageRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    pub role: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Concrete `AgentRuntime` backed by the Claude Messages API. One HTTP call
/// per `execute` — there is no in-process agentic tool loop here; the prompt
/// is expected to be self-contained (the engine supplies full context up
/// front via `StageExecutor::build_context`).
pub struct ClaudeAgentRuntime {
    client: ClaudeClient,
    model: String,
    max_tokens: u32,
}

impl ClaudeAgentRuntime {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: ClaudeClient::new(api_key),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_client(client: ClaudeClient, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
        }
    }
}

#[async_trait]
impl AgentRuntime for ClaudeAgentRuntime {
    async fn execute(
        &self,
        request: AgentRequest,
        on_output: Option<OutputSink>,
        abort: &AbortHandle,
    ) -> Result<AgentResponse> {
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        let api_request = CreateMessageRequest {
            model,
            max_tokens: self.max_tokens,
            messages: vec![MessageContent {
                role: "user".to_string(),
                content: serde_json::Value::String(request.user_prompt),
            }],
            system: Some(request.system_prompt),
        };

        let call = self.client.create_message(api_request);
        tokio::pin!(call);

        let response = tokio::select! {
            result = &mut call => result.map_err(|e| Error::Other(e.to_string()))?,
            _ = abort.cancelled() => return Err(Error::Other("agent runtime call aborted".to_string())),
        };

        let text_output = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if let Some(sink) = on_output {
            sink(&text_output);
        }

        let extracted_data = serde_json::from_str::<serde_json::Value>(text_output.trim()).ok();

        debug!(model = %response.model, stop_reason = ?response.stop_reason, "claude response received");

        Ok(AgentResponse {
            text_output,
            extracted_data,
            token_usage: TokenUsage {
                input: response.usage.input_tokens.max(0) as u64,
                output: response.usage.output_tokens.max(0) as u64,
                total: (response.usage.input_tokens.max(0) + response.usage.output_tokens.max(0)) as u64,
                cache_read: None,
                cache_write: None,
            },
            num_turns: 1,
        })
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_streaming: false,
            supports_token_tracking: true,
            available_models: vec![self.model.clone()],
            permission_modes: vec![
                "default".to_string(),
                "acceptEdits".to_string(),
                "bypassPermissions".to_string(),
                "plan".to_string(),
            ],
        }
    }

    fn validate(&self) -> RuntimeValidation {
        RuntimeValidation {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_anthropic() {
        let config = ClaudeClientConfig::default();
        assert_eq!(config.base_url, "https://api.anthropic.com/v1");
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn runtime_reports_token_tracking_capability() {
        let runtime = ClaudeAgentRuntime::new("test-key");
        assert!(runtime.capabilities().supports_token_tracking);
    }
}
