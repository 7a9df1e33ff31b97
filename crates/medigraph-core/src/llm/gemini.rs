use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use medigraph_common::config::{mask_secret, LLMProvider, DEFAULT_LLM_TEMPERATURE, DEFAULT_LLM_TIMEOUT_SECS};
use medigraph_common::TokenUsage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use super::{http_client, LLMClient, LLMResponse};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

// ── Wire types ────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Instruction<'a>,
    contents: [UserTurn<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Instruction<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct UserTurn<'a> {
    role: &'static str,
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    candidate_count: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ReplyPart>,
}

#[derive(Deserialize)]
struct ReplyPart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl From<UsageMetadata> for TokenUsage {
    fn from(u: UsageMetadata) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

// ── Client ────────────────────────────────────────────────────────

/// Google Gemini `generateContent` client. The key travels in the
/// `x-goog-api-key` header, never in the URL.
pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: http_client(DEFAULT_LLM_TIMEOUT_SECS),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into().trim().to_string(),
            model: model.into(),
            temperature: DEFAULT_LLM_TEMPERATURE,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
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

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url,
            self.model.trim_start_matches("models/")
        )
    }
}

#[async_trait]
impl LLMClient for GeminiClient {
    fn provider(&self) -> LLMProvider {
        LLMProvider::Gemini
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<LLMResponse<String>> {
        let request = GenerateRequest {
            system_instruction: Instruction { parts: [TextPart { text: system_prompt }] },
            contents: [UserTurn { role: "user", parts: [TextPart { text: user_prompt }] }],
            generation_config: GenerationConfig { temperature: self.temperature, candidate_count: 1 },
        };
        let url = self.endpoint();
        tracing::debug!("POST {} (key {})", url, mask_secret(&self.api_key));

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .context("Gemini request failed")?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let detail = match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(e) => match e.error.status {
                    Some(code) => format!("{} {}", code, e.error.message),
                    None => e.error.message,
                },
                Err(_) => body,
            };
            bail!("Gemini API error ({}): {}", status, detail);
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .with_context(|| format!("Unreadable Gemini response: {}", body))?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("No content in Gemini response"));
        }

        Ok(LLMResponse {
            data: text.to_string(),
            usage: parsed.usage_metadata.map(TokenUsage::from).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
#[path = "gemini_tests.rs"]
mod gemini_tests;
