//! Async client for the external VLM service.
//!
//! Supports multipart file upload, a dual completion strategy (webhook-fed
//! job store checked first, polling as fallback), and retry with exponential
//! backoff. 4xx responses never retry - resubmitting a bad request burns the
//! job queue for nothing.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::models::vlm::VlmCompareResult;
use crate::models::{
    JobStatus, MappingContext, VlmHealth, VlmJobOptions, VlmJobResponse, VlmJobStatus, VlmResult,
};
use crate::utils::{ApiError, ApiResult};

use super::job_store::VlmJobStore;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_BASE: f64 = 2.0;

/// VLM operations; the HTTP client implements this, tests provide fakes.
#[async_trait]
pub trait VlmService: Send + Sync {
    async fn check_health(&self) -> ApiResult<VlmHealth>;

    async fn submit_file(
        &self,
        file_path: &Path,
        prompt_template: Option<&str>,
        options: Option<&VlmJobOptions>,
    ) -> ApiResult<VlmJobResponse>;

    async fn get_status(&self, job_id: &str) -> ApiResult<VlmJobStatus>;

    async fn wait_for_result(&self, job_id: &str, timeout: Duration) -> ApiResult<VlmResult>;

    async fn validate_mappings(
        &self,
        page_image: &Path,
        extracted_images: &[PathBuf],
        context: &MappingContext,
        options: &VlmJobOptions,
    ) -> ApiResult<VlmJobResponse>;

    async fn compare_images(
        &self,
        reference: &Path,
        comparisons: &[PathBuf],
        comparison_type: &str,
    ) -> ApiResult<VlmCompareResult>;
}

pub struct HttpVlmClient {
    http_client: Client,
    base_url: String,
    webhook_url: Option<String>,
    job_store: Arc<VlmJobStore>,
}

impl HttpVlmClient {
    pub fn new(base_url: &str, webhook_url: Option<String>, job_store: Arc<VlmJobStore>) -> Self {
        let http_client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            webhook_url,
            job_store,
        }
    }

    pub fn job_store(&self) -> Arc<VlmJobStore> {
        Arc::clone(&self.job_store)
    }

    async fn file_part(path: &Path) -> ApiResult<Part> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ApiError::dependency("vlm", format!("{}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let part = Part::bytes(data)
            .file_name(file_name)
            .mime_str(guess_content_type(path))
            .map_err(|e| ApiError::dependency("vlm", e.to_string()))?;
        Ok(part)
    }

    /// POST a multipart form with retry. The form is rebuilt per attempt
    /// because reqwest forms are consumed on send.
    async fn post_multipart_with_retry<F, Fut>(
        &self,
        url: &str,
        build_form: F,
    ) -> ApiResult<serde_json::Value>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ApiResult<Form>>,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            let form = build_form().await?;
            let result = self.http_client.post(url).multipart(form).send().await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| ApiError::dependency("vlm", format!("parse error: {}", e)));
                    }

                    let body = response.text().await.unwrap_or_default();
                    let error =
                        ApiError::dependency("vlm", format!("API error {}: {}", status, body));
                    if status.is_client_error() {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
                Err(e) => {
                    last_error = Some(ApiError::dependency("vlm", e.to_string()));
                }
            }

            if attempt < MAX_RETRIES - 1 {
                let wait = RETRY_BACKOFF_BASE.powi(attempt as i32);
                tracing::warn!(
                    "VLM request failed (attempt {}), retrying in {}s",
                    attempt + 1,
                    wait
                );
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| ApiError::dependency("vlm", "request failed with no attempts")))
    }

    fn parse_job_response(&self, value: serde_json::Value) -> ApiResult<VlmJobResponse> {
        serde_json::from_value(value)
            .map_err(|e| ApiError::dependency("vlm", format!("bad job response: {}", e)))
    }
}

#[async_trait]
impl VlmService for HttpVlmClient {
    async fn check_health(&self) -> ApiResult<VlmHealth> {
        let url = format!("{}/api/v1/health", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::dependency("vlm", e.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiError::dependency(
                "vlm",
                format!("health check returned {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::dependency("vlm", e.to_string()))
    }

    async fn submit_file(
        &self,
        file_path: &Path,
        prompt_template: Option<&str>,
        options: Option<&VlmJobOptions>,
    ) -> ApiResult<VlmJobResponse> {
        if !file_path.exists() {
            return Err(ApiError::dependency(
                "vlm",
                format!("file not found: {}", file_path.display()),
            ));
        }

        let url = format!("{}/api/v1/jobs/upload", self.base_url);
        let webhook_url = self.webhook_url.clone();
        let template = prompt_template.map(str::to_string);
        let options_json = options.map(serde_json::to_string).transpose()?;

        let value = self
            .post_multipart_with_retry(&url, async || {
                let mut form = Form::new().part("file", Self::file_part(file_path).await?);
                if let Some(webhook) = &webhook_url {
                    form = form.text("webhook_url", webhook.clone());
                }
                if let Some(template) = &template {
                    form = form.text("prompt_template", template.clone());
                }
                if let Some(options) = &options_json {
                    form = form.text("options", options.clone());
                }
                Ok(form)
            })
            .await?;

        let job = self.parse_job_response(value)?;
        self.job_store.mark_pending(&job.job_id);
        tracing::info!("Submitted VLM job {} for {}", job.job_id, file_path.display());
        Ok(job)
    }

    async fn get_status(&self, job_id: &str) -> ApiResult<VlmJobStatus> {
        let url = format!("{}/api/v1/jobs/{}", self.base_url, job_id);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::dependency("vlm", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::dependency(
                "vlm",
                format!("status poll returned {}: {}", status, body),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::dependency("vlm", format!("bad status response: {}", e)))
    }

    /// Wait for a job: job store first (webhook may already have delivered),
    /// then poll; the deadline bounds the whole loop.
    async fn wait_for_result(&self, job_id: &str, timeout: Duration) -> ApiResult<VlmResult> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(result) = self.job_store.get_result(job_id) {
                tracing::info!("Got VLM result for {} from job store", job_id);
                return Ok(result);
            }
            if let Some(error) = self.job_store.get_error(job_id) {
                return Err(ApiError::VlmJobFailed { job_id: job_id.to_string(), message: error });
            }

            match self.get_status(job_id).await {
                Ok(status) => match status.status {
                    JobStatus::Completed => {
                        if let Some(result) = status.result {
                            self.job_store.store_result(job_id, result.clone());
                            tracing::info!("Got VLM result for {} from polling", job_id);
                            return Ok(result);
                        }
                        // completed without a body; keep polling until deadline
                        tracing::warn!("VLM job {} completed with empty result, retrying", job_id);
                    }
                    JobStatus::Failed => {
                        let message = status.error.unwrap_or_else(|| "Unknown error".to_string());
                        self.job_store.store_error(job_id, message.clone());
                        return Err(ApiError::VlmJobFailed {
                            job_id: job_id.to_string(),
                            message,
                        });
                    }
                    JobStatus::Pending | JobStatus::Processing => {}
                },
                Err(e) => {
                    tracing::warn!("Error polling job {}: {}", job_id, e);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ApiError::timeout(
                    format!("VLM job {}", job_id),
                    timeout.as_secs(),
                ));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn validate_mappings(
        &self,
        page_image: &Path,
        extracted_images: &[PathBuf],
        context: &MappingContext,
        options: &VlmJobOptions,
    ) -> ApiResult<VlmJobResponse> {
        let url = format!("{}/api/v1/jobs/validate-mappings", self.base_url);
        let context_json = serde_json::to_string(context)?;
        let options_json = serde_json::to_string(options)?;
        let webhook_url = self.webhook_url.clone();

        let value = self
            .post_multipart_with_retry(&url, async || {
                let mut form = Form::new()
                    .part("page_image", Self::file_part(page_image).await?)
                    .text("mapping_context", context_json.clone())
                    .text("options", options_json.clone());
                for path in extracted_images {
                    form = form.part("extracted_images[]", Self::file_part(path).await?);
                }
                if let Some(webhook) = &webhook_url {
                    form = form.text("webhook_url", webhook.clone());
                }
                Ok(form)
            })
            .await?;

        let job = self.parse_job_response(value)?;
        self.job_store.mark_pending(&job.job_id);
        Ok(job)
    }

    async fn compare_images(
        &self,
        reference: &Path,
        comparisons: &[PathBuf],
        comparison_type: &str,
    ) -> ApiResult<VlmCompareResult> {
        let url = format!("{}/api/v1/compare", self.base_url);
        let comparison_type = comparison_type.to_string();

        let value = self
            .post_multipart_with_retry(&url, async || {
                let mut form = Form::new()
                    .part("reference_image", Self::file_part(reference).await?)
                    .text("comparison_type", comparison_type.clone());
                for path in comparisons {
                    form = form.part("comparison_images[]", Self::file_part(path).await?);
                }
                Ok(form)
            })
            .await?;

        serde_json::from_value(value)
            .map_err(|e| ApiError::dependency("vlm", format!("bad compare response: {}", e)))
    }
}

fn guess_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        _ => "application/octet-stream",
    }
}
