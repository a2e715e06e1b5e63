//! LLM Client - HTTP client for OpenAI-compatible APIs
//!
//! Used for intent classification fallback, search granularity routing, and
//! text-to-SQL generation. Compatible with any /v1/chat/completions server.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::{ApiError, ApiResult};

/// Chat completion seam; tests substitute a scripted fake.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Single user-turn completion, returns the raw assistant content.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> ApiResult<String>;
}

/// LLM HTTP client
pub struct LlmClient {
    http_client: Client,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').trim_end_matches("/v1").to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LlmService for LlmClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> ApiResult<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage { role: "user".to_string(), content: prompt.to_string() }],
            max_tokens: Some(max_tokens),
            temperature: Some(0.1),
        };

        tracing::debug!("Calling LLM API: {} with model {}", url, self.model);

        let response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::timeout("LLM completion", 60)
                } else {
                    ApiError::dependency("llm", e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ApiError::dependency("llm", format!("API error {}: {}", status, error_text)));
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::dependency("llm", format!("Failed to parse response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ApiError::dependency("llm", "Empty response from LLM".to_string()))
    }
}

/// Extract the first top-level JSON object from LLM output. Models wrap JSON
/// in prose or code fences more often than not.
pub fn extract_json(content: &str) -> Option<serde_json::Value> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}

// ============================================================================
// OpenAI API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_from_fenced_output() {
        let content = "Here you go:\n```json\n{\"intent\": \"SEMANTIC\", \"confidence\": 0.8}\n```";
        let value = extract_json(content).unwrap();
        assert_eq!(value["intent"], "SEMANTIC");
    }

    #[test]
    fn extract_json_none_when_missing() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("} {").is_none());
    }
}
