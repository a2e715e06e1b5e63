//! Embedding client for the external BGE-M3 style service.
//!
//! Vectors come back L2-normalized; the dimension is fixed per deployment.
//! Errors always surface - a zero vector standing in for a failed embed would
//! silently poison both collections.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::{ApiError, ApiResult};

const SINGLE_TIMEOUT: Duration = Duration::from_secs(30);
const BATCH_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Embeddings: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> ApiResult<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> ApiResult<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| ApiError::dependency("embeddings", "empty embedding response"))
    }
}

pub struct EmbeddingClient {
    http_client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    normalize: bool,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl EmbeddingClient {
    pub fn new(base_url: &str) -> Self {
        let http_client = Client::builder()
            .timeout(BATCH_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self { http_client, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl Embeddings for EmbeddingClient {
    async fn embed_batch(&self, texts: &[String]) -> ApiResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(empty) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(ApiError::invalid_data(format!(
                "refusing to embed empty text at index {}",
                empty
            )));
        }

        let timeout = if texts.len() == 1 { SINGLE_TIMEOUT } else { BATCH_TIMEOUT };
        let url = format!("{}/embed", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .timeout(timeout)
            .json(&EmbedRequest { inputs: texts, normalize: true })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::timeout("embedding request", timeout.as_secs())
                } else {
                    ApiError::dependency("embeddings", e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::dependency(
                "embeddings",
                format!("API error {}: {}", status, body),
            ));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ApiError::dependency("embeddings", format!("parse error: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(ApiError::dependency(
                "embeddings",
                format!("expected {} vectors, got {}", texts.len(), parsed.embeddings.len()),
            ));
        }

        Ok(parsed.embeddings)
    }
}
