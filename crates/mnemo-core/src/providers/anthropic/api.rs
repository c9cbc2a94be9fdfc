//! Anthropic Messages API client (API key auth).

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;

use super::sse::SseParser;
use super::types::{ApiMessage, ApiToolDef, StreamingMessagesRequest, SystemBlock, ThinkingConfig};
use crate::config::Config;
use crate::providers::ModelClient;
use crate::providers::shared::{
    ChatMessage, ProviderError, ProviderErrorKind, ProviderStream, USER_AGENT, resolve_api_key,
    resolve_base_url,
};
use crate::tools::ToolDefinition;

/// Default base URL for the Anthropic API.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const API_VERSION: &str = "2023-06-01";
const BETA_HEADER: &str = "fine-grained-tool-streaming-2025-05-14";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the Anthropic client.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// Extended thinking budget; `None` disables thinking.
    pub thinking_budget_tokens: Option<u32>,
    pub request_timeout: Duration,
}

impl AnthropicConfig {
    /// Builds the client config from the loaded `Config` plus environment.
    ///
    /// API key: `[providers.anthropic].api_key`, then `ANTHROPIC_API_KEY`.
    /// Base URL: `ANTHROPIC_BASE_URL`, then config, then the public endpoint.
    ///
    /// # Errors
    /// Returns an error if no API key is available or the base URL is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider = &config.providers.anthropic;
        let api_key = resolve_api_key(provider.api_key.as_deref(), "ANTHROPIC_API_KEY", "anthropic")?;
        let base_url = resolve_base_url(
            provider.base_url.as_deref(),
            "ANTHROPIC_BASE_URL",
            DEFAULT_BASE_URL,
            "Anthropic",
        )?;

        Ok(Self {
            api_key,
            base_url,
            model: config.effective_model(),
            max_tokens: config.max_tokens,
            thinking_budget_tokens: config.thinking_budget_tokens,
            request_timeout: Duration::from_secs(provider.request_timeout_secs),
        })
    }
}

/// Anthropic API client.
pub struct AnthropicClient {
    config: AnthropicConfig,
    http: reqwest::Client,
}

impl AnthropicClient {
    /// Creates a new client.
    ///
    /// # Panics
    /// - In test builds, panics if `base_url` is the production API.
    /// - At runtime, panics if `MNEMO_BLOCK_REAL_API=1` and `base_url` is the
    ///   production API. Integration tests set this so a missing mock server
    ///   never turns into a real request.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        #[cfg(test)]
        if config.base_url == DEFAULT_BASE_URL {
            panic!(
                "Tests must not use the production Anthropic API!\n\
                 Set ANTHROPIC_BASE_URL to a mock server.\n\
                 Found base_url: {}",
                config.base_url
            );
        }

        #[cfg(not(test))]
        if std::env::var("MNEMO_BLOCK_REAL_API").is_ok_and(|v| v == "1")
            && config.base_url == DEFAULT_BASE_URL
        {
            panic!(
                "MNEMO_BLOCK_REAL_API=1 but trying to use production Anthropic API!\n\
                 Set ANTHROPIC_BASE_URL to a mock server.\n\
                 Found base_url: {}",
                config.base_url
            );
        }

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        system: Option<&str>,
    ) -> Result<ProviderStream> {
        let mut api_messages: Vec<ApiMessage> = messages.iter().map(ApiMessage::from).collect();
        sanitize_tool_use_ids(&mut api_messages);

        let request = StreamingMessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            messages: api_messages,
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.iter().map(ApiToolDef::from).collect())
            },
            system: system
                .filter(|s| !s.trim().is_empty())
                .map(|s| vec![SystemBlock::text(s)]),
            thinking: self.config.thinking_budget_tokens.map(ThinkingConfig::enabled),
            stream: true,
        };

        let url = format!("{}/v1/messages", self.config.base_url);
        tracing::debug!(%url, model = %self.config.model, messages = messages.len(), "sending request");

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .header("user-agent", USER_AGENT)
            .header("anthropic-version", API_VERSION)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-beta", BETA_HEADER)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http_status(status.as_u16(), &body).into());
        }

        Ok(Box::pin(SseParser::new(response.bytes_stream())))
    }
}

impl ModelClient for AnthropicClient {
    fn send_messages_stream<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolDefinition],
        system: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ProviderStream>> {
        Box::pin(self.stream(messages, tools, system))
    }
}

/// The API only accepts `[A-Za-z0-9_-]` in tool ids.
fn sanitize_tool_use_ids(messages: &mut [ApiMessage]) {
    use super::types::{ApiContentBlock, ApiMessageContent};

    fn clean(id: &mut String) {
        if id
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        {
            *id = id
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
        }
    }

    for message in messages {
        let ApiMessageContent::Blocks(blocks) = &mut message.content else {
            continue;
        };
        for block in blocks {
            match block {
                ApiContentBlock::ToolUse { id, .. } => clean(id),
                ApiContentBlock::ToolResult { tool_use_id, .. } => clean(tool_use_id),
                _ => {}
            }
        }
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::timeout(format!("Connection failed: {e}"))
    } else if e.is_request() {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Request error: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Network error: {e}"))
    }
}
