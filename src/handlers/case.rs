//! Case lifecycle handlers: ingest, delete, stats.

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use utoipa::ToSchema;

use crate::AppState;
use crate::models::{StatsResponse, UserContext};
use crate::services::ingestion::{IngestReport, IngestionOptions};
use crate::utils::ApiResult;

pub const TOOL_DELETE_CASE: &str = "delete_case";
pub const TOOL_REINDEX_CASE: &str = "reindex_case";

#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestRequest {
    /// Path to the spreadsheet on the server filesystem
    pub file_path: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub validate_mappings: Option<bool>,
    #[serde(default)]
    pub vlm_enrich: Option<bool>,
    #[serde(default)]
    pub auto_correct_threshold: Option<f64>,
}

/// Ingest one case spreadsheet
/// POST /api/cases/ingest
#[utoipa::path(
    post,
    path = "/api/cases/ingest",
    request_body = IngestRequest,
    responses(
        (status = 200, description = "Case ingested"),
        (status = 403, description = "Tool invocation denied"),
        (status = 422, description = "Spreadsheet unreadable or empty"),
    ),
    tag = "Cases"
)]
pub async fn ingest_case(
    State(state): State<Arc<AppState>>,
    Extension(user_context): Extension<Option<UserContext>>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<Json<IngestReport>> {
    let user_id = user_context.as_ref().map(|u| u.user_id.clone());
    let params = serde_json::json!({"file_path": request.file_path, "limit": request.limit});
    let started = Instant::now();

    state
        .rbac
        .authorize(TOOL_REINDEX_CASE, user_context.as_ref())
        .await?;

    let options = IngestionOptions {
        limit: request.limit,
        validate_mappings: request
            .validate_mappings
            .unwrap_or(state.config.ingestion.validate_mappings),
        vlm_enrich: request.vlm_enrich.unwrap_or(state.config.ingestion.vlm_enrich),
        auto_correct_threshold: request.auto_correct_threshold,
    };

    let outcome = state
        .ingestion
        .ingest_case(std::path::Path::new(&request.file_path), &options)
        .await;

    let result = match &outcome {
        Ok(report) => serde_json::to_value(report).unwrap_or_default(),
        Err(e) => serde_json::json!({"error": e.to_string()}),
    };
    state
        .audit
        .record(user_id.as_deref(), TOOL_REINDEX_CASE, &params, &result, started)
        .await;

    outcome.map(Json)
}

/// Remove a case from the relational and vector stores
/// DELETE /api/cases/:case_id
#[utoipa::path(
    delete,
    path = "/api/cases/{case_id}",
    params(("case_id" = String, Path, description = "Case identifier")),
    responses(
        (status = 200, description = "Case deleted"),
        (status = 403, description = "Tool invocation denied"),
    ),
    tag = "Cases"
)]
pub async fn delete_case(
    State(state): State<Arc<AppState>>,
    Extension(user_context): Extension<Option<UserContext>>,
    Path(case_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = user_context.as_ref().map(|u| u.user_id.clone());
    let params = serde_json::json!({"case_id": case_id});
    let started = Instant::now();

    state
        .rbac
        .authorize(TOOL_DELETE_CASE, user_context.as_ref())
        .await?;

    let outcome = state.indexer.delete_case(&case_id).await;

    let result = match &outcome {
        Ok(()) => serde_json::json!({"status": "deleted", "case_id": case_id}),
        Err(e) => serde_json::json!({"error": e.to_string()}),
    };
    state
        .audit
        .record(user_id.as_deref(), TOOL_DELETE_CASE, &params, &result, started)
        .await;

    outcome?;
    Ok(Json(serde_json::json!({"status": "deleted", "case_id": case_id})))
}

/// Store and cache statistics
/// GET /api/stats
#[utoipa::path(
    get,
    path = "/api/stats",
    responses((status = 200, description = "Statistics", body = StatsResponse)),
    tag = "System"
)]
pub async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatsResponse>> {
    let relational = state.knowledge.table_counts().await?;

    let case_points = state
        .vector_store
        .point_count(&state.vector_store.case_collection)
        .await?;
    let issue_points = state
        .vector_store
        .point_count(&state.vector_store.issue_collection)
        .await?;

    Ok(Json(StatsResponse {
        relational,
        vector: serde_json::json!({
            "cases": case_points,
            "issues": issue_points,
        }),
        cache: state.cache.get_stats(),
    }))
}
