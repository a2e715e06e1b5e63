//! VLM webhook receiver.
//!
//! The VLM service posts job completions here; the payload lands in the job
//! store where `wait_for_result` picks it up ahead of its next poll.

use axum::{Json, extract::State, http::StatusCode};
use std::sync::Arc;

use crate::AppState;
use crate::models::{VlmResult, VlmWebhookPayload};

/// Receive a job-completed webhook from the VLM service
/// POST /api/vlm/webhook
#[utoipa::path(
    post,
    path = "/api/vlm/webhook",
    request_body = VlmWebhookPayload,
    responses((status = 200, description = "Acknowledged")),
    tag = "VLM"
)]
pub async fn vlm_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<VlmWebhookPayload>,
) -> StatusCode {
    if payload.event != "job.completed" {
        tracing::debug!("Ignoring VLM webhook event '{}'", payload.event);
        return StatusCode::OK;
    }

    if let Some(error) = payload.error {
        tracing::warn!("VLM job {} reported failure via webhook: {}", payload.job_id, error);
        state.vlm_job_store.store_error(&payload.job_id, error);
    } else if let Some(result) = payload.result {
        match serde_json::from_value::<VlmResult>(result) {
            Ok(result) => {
                tracing::info!("VLM job {} delivered via webhook", payload.job_id);
                state.vlm_job_store.store_result(&payload.job_id, result);
            }
            Err(e) => {
                tracing::warn!("Unparseable webhook result for job {}: {}", payload.job_id, e);
                state
                    .vlm_job_store
                    .store_error(&payload.job_id, format!("unparseable webhook result: {}", e));
            }
        }
    } else {
        tracing::warn!("VLM webhook for job {} had neither result nor error", payload.job_id);
    }

    state.vlm_job_store.purge_expired();
    StatusCode::OK
}
