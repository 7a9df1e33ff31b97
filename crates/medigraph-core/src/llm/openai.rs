use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use medigraph_common::config::{mask_secret, LLMProvider, DEFAULT_LLM_TEMPERATURE, DEFAULT_LLM_TIMEOUT_SECS};
use medigraph_common::TokenUsage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use super::{http_client, LLMClient, LLMResponse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [Turn<'a>; 2],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAIClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl fmt::Debug for OpenAIClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAIClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: http_client(DEFAULT_LLM_TIMEOUT_SECS),
            endpoint: format!("{}/chat/completions", DEFAULT_BASE_URL),
            api_key: api_key.into().trim().to_string(),
            model: model.into(),
            temperature: DEFAULT_LLM_TEMPERATURE,
            max_tokens: None,
        }
    }

    /// Points the client at another compatible server, e.g. `http://localhost:11434/v1`.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.http = http_client(secs);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    fn provider(&self) -> LLMProvider {
        LLMProvider::OpenAI
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<LLMResponse<String>> {
        let request = CompletionRequest {
            model: &self.model,
            messages: [
                Turn { role: "system", content: system_prompt },
                Turn { role: "user", content: user_prompt },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        tracing::debug!("POST {} (model {}, key {})", self.endpoint, self.model, mask_secret(&self.api_key));

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let detail = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            bail!("OpenAI API error ({}): {}", status, detail);
        }

        let parsed: CompletionResponse = serde_json::from_str(&body)
            .with_context(|| format!("Unreadable OpenAI response: {}", body))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("No content in OpenAI response"))?;

        Ok(LLMResponse { data: text, usage: parsed.usage.unwrap_or_default() })
    }
}

#[cfg(test)]
#[path = "openai_tests.rs"]
mod openai_tests;
