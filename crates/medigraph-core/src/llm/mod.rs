//! Clients for the generation API that writes Cypher from questions.

pub mod gemini;
pub mod openai;

pub use gemini::GeminiClient;
pub use openai::OpenAIClient;

use anyhow::Result;
use async_trait::async_trait;
use medigraph_common::config::{mask_secret, AppConfig, LLMProvider};
use medigraph_common::TokenUsage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Builds the client for the configured provider, or `None` when no key is set.
pub fn create_llm_client(config: &AppConfig) -> Option<Arc<dyn LLMClient>> {
    let api_key = config.get_active_key()?;
    let llm = &config.llm;
    let model = config.get_model_name();
    tracing::debug!("Generation client for {:?} with key {}", llm.provider, mask_secret(&api_key));

    let client: Arc<dyn LLMClient> = match llm.provider {
        LLMProvider::OpenAI => {
            let mut client = OpenAIClient::new(api_key, model)
                .with_temperature(llm.temperature)
                .with_timeout(llm.timeout_secs);
            if let Some(url) = config.get_base_url() {
                client = client.with_base_url(&url);
            }
            Arc::new(client)
        }
        LLMProvider::Gemini => {
            let mut client = GeminiClient::new(api_key, model)
                .with_temperature(llm.temperature)
                .with_timeout(llm.timeout_secs);
            if let Some(url) = config.get_base_url() {
                client = client.with_base_url(&url);
            }
            Arc::new(client)
        }
    };
    Some(client)
}

fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("medigraph/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMResponse<T> {
    pub data: T,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LLMClient: Send + Sync {
    fn provider(&self) -> LLMProvider;

    fn model(&self) -> &str;

    /// One system instruction plus one user turn. Returns the trimmed reply.
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<LLMResponse<String>>;
}
