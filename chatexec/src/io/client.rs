//! Chat-completion client abstraction and its HTTP implementation.
//!
//! The [`ChatClient`] trait decouples the task loop from the model
//! provider. Tests use scripted clients that return predetermined replies
//! without any network access.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{ChatMessage, Completion, TokenUsage};
use crate::io::config::ClientConfig;

/// Abstraction over chat-completion backends.
pub trait ChatClient {
    /// Send the full conversation and return the next assistant message.
    fn complete(&self, messages: &[ChatMessage]) -> Result<Completion>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

/// Client for an OpenAI-compatible chat completion endpoint.
pub struct HttpChatClient {
    http: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

impl HttpChatClient {
    /// Build a client from configuration, resolving the API key from the
    /// configured environment variable when one is named.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .with_context(|| format!("read API key from ${var}"))?,
            ),
            None => None,
        };
        Ok(Self {
            http: reqwest::blocking::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }
}

impl ChatClient for HttpChatClient {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    fn complete(&self, messages: &[ChatMessage]) -> Result<Completion> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.http.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .context("chat completion request rejected")?;

        let body: ChatCompletionResponse =
            response.json().context("parse chat completion response")?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("chat completion response contained no choices"))?;
        let usage = body.usage.unwrap_or_default().into();
        debug!("received completion");
        Ok(Completion {
            content: choice.message.content,
            usage,
        })
    }
}
