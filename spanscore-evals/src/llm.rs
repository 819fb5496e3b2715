// Copyright 2025 Spanscore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! LLM client abstraction for LLM-as-judge scoring.
//!
//! The lifecycle manager never calls a provider directly; it goes through
//! [`LlmClient`] so the judge backend can be swapped (or mocked in tests).
//! [`LlmError`] separates provider-unreachable faults from bad responses:
//! the former fail the whole execution, the latter only the span.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spanscore_core::{ChatMessage, ResponseFormat};
use thiserror::Error;

/// Sampling parameters forwarded to the judge model.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub model: String,
    pub temperature: f64,
    pub response_format: ResponseFormat,
}

/// Response from the judge model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    /// Parse the content as JSON.
    pub fn as_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.content)
    }
}

/// Token usage information reported by the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Errors from LLM clients.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider could not be reached at all. Mapped to an
    /// execution-level failure by the lifecycle manager.
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether this error poisons the whole execution rather than one span.
    pub fn is_execution_fatal(&self) -> bool {
        matches!(self, LlmError::Unreachable(_))
    }
}

/// Trait for judge-model backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a rendered message list and get a completion back.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<LlmResponse, LlmError>;

    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<LlmResponse, LlmError> {
        let model = if params.model.is_empty() {
            &self.model
        } else {
            &params.model
        };

        let rendered: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let mut request = serde_json::json!({
            "model": model,
            "messages": rendered,
            "temperature": params.temperature,
        });
        if params.response_format == ResponseFormat::Json {
            request["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    LlmError::Unreachable(e.to_string())
                } else {
                    LlmError::Api(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(LlmError::RateLimited);
            }
            return Err(LlmError::Api(error_text));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::InvalidResponse("missing content".to_string()))?
            .to_string();

        let usage = body.get("usage").map(|u| TokenUsage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: u["total_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(LlmResponse {
            content,
            model: model.clone(),
            usage,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
