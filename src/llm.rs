//! Language model clients.
//!
//! The [`LanguageModel`] trait is the only view the rest of the crate has of
//! the hosted model: one system prompt, one user prompt, one text answer.
//!
//! - **[`AnthropicClient`]**: Anthropic Messages API (`ANTHROPIC_API_KEY`).
//! - **[`OpenAIChatClient`]**: any OpenAI-compatible `/chat/completions`
//!   endpoint (`OPENAI_API_KEY`).
//! - **[`DisabledModel`]**: always fails; retrieval-only deployments.
//!
//! Both HTTP clients share the retry/backoff policy in `http`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::error::{Result, Text2SqlError};
use crate::http;

/// Model answer plus token accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion>;
}

/// Instantiate the model client named by `config.provider`.
pub fn create_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "anthropic" => Ok(Arc::new(AnthropicClient::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIChatClient::new(config)?)),
        other => Err(Text2SqlError::Configuration(format!(
            "unknown llm provider: {}",
            other
        ))),
    }
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _system: &str, _prompt: &str) -> Result<Completion> {
        Err(Text2SqlError::Model(
            "language model is disabled; set [llm] provider".into(),
        ))
    }
}

fn required_model(config: &LlmConfig) -> Result<String> {
    config.model.clone().ok_or_else(|| {
        Text2SqlError::Configuration(format!(
            "llm.model required for {} provider",
            config.provider
        ))
    })
}

fn api_key(var: &str) -> Result<String> {
    std::env::var(var)
        .map_err(|_| Text2SqlError::Configuration(format!("{} environment variable not set", var)))
}

// ============ Anthropic ============

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    max_retries: u32,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            model: required_model(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string()),
            api_key: api_key("ANTHROPIC_API_KEY")?,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
        });
        let json = http::post_json_with_retry(
            &self.client,
            &self.url,
            &[
                ("x-api-key", self.api_key.clone()),
                ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ],
            &body,
            self.max_retries,
            "Anthropic",
        )
        .await?;

        let completion = parse_anthropic_response(&json)?;
        log_usage(&self.model, &completion);
        Ok(completion)
    }
}

/// Concatenate `content[].text` blocks; read `usage`.
fn parse_anthropic_response(json: &serde_json::Value) -> Result<Completion> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| Text2SqlError::Model("invalid Anthropic response: missing content".into()))?;

    let text: String = blocks
        .iter()
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");

    let usage = json.get("usage");
    Ok(Completion {
        text,
        input_tokens: usage_field(usage, "input_tokens"),
        output_tokens: usage_field(usage, "output_tokens"),
    })
}

// ============ OpenAI-compatible chat ============

pub struct OpenAIChatClient {
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            model: required_model(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            api_key: api_key("OPENAI_API_KEY")?,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIChatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });
        let json = http::post_json_with_retry(
            &self.client,
            &self.url,
            &[("Authorization", format!("Bearer {}", self.api_key))],
            &body,
            self.max_retries,
            "OpenAI chat",
        )
        .await?;

        let completion = parse_openai_chat_response(&json)?;
        log_usage(&self.model, &completion);
        Ok(completion)
    }
}

fn parse_openai_chat_response(json: &serde_json::Value) -> Result<Completion> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            Text2SqlError::Model("invalid OpenAI response: missing choices[0].message".into())
        })?;

    let usage = json.get("usage");
    Ok(Completion {
        text: text.to_string(),
        input_tokens: usage_field(usage, "prompt_tokens"),
        output_tokens: usage_field(usage, "completion_tokens"),
    })
}

fn usage_field(usage: Option<&serde_json::Value>, name: &str) -> u64 {
    usage
        .and_then(|u| u.get(name))
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

fn log_usage(model: &str, completion: &Completion) {
    tracing::debug!(
        model,
        input_tokens = completion.input_tokens,
        output_tokens = completion.output_tokens,
        "model call completed"
    );
}
