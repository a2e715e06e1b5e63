//! Query API handler.
//!
//! The knowledge-base query is a protected tool invocation: RBAC runs before
//! the search, the audit record is written after it completes either way.

use axum::{Extension, Json, extract::State, http::StatusCode};
use std::sync::Arc;
use std::time::Instant;
use validator::Validate;

use crate::AppState;
use crate::models::{QueryRequest, QueryResponse, UserContext};
use crate::utils::{ApiError, ApiResult};

pub const TOOL_QUERY: &str = "query_knowledge_base";

/// Run a natural-language query through the hybrid retrieval pipeline
/// POST /api/query
#[utoipa::path(
    post,
    path = "/api/query",
    request_body = QueryRequest,
    responses(
        (status = 200, description = "Search results", body = QueryResponse),
        (status = 403, description = "Tool invocation denied"),
    ),
    tag = "Query"
)]
pub async fn query(
    State(state): State<Arc<AppState>>,
    Extension(authenticated): Extension<Option<UserContext>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    request
        .validate()
        .map_err(|e| ApiError::invalid_data(e.to_string()))?;

    // explicit context in the body wins over the bearer token
    let user_context = request.user_context.clone().or(authenticated);
    let user_id = user_context.as_ref().map(|u| u.user_id.clone());

    let params = serde_json::json!({
        "query": request.query,
        "mode": request.mode.as_str(),
        "top_k": request.top_k,
        "filters": request.filters,
    });
    let started = Instant::now();

    if let Err(denial) = state.rbac.authorize(TOOL_QUERY, user_context.as_ref()).await {
        let result = serde_json::json!({"error": denial.to_string()});
        state
            .audit
            .record(user_id.as_deref(), TOOL_QUERY, &params, &result, started)
            .await;
        return Err(denial);
    }

    let outcome = state
        .hybrid_searcher
        .search(
            &request.query,
            request.mode,
            request.top_k,
            request.filters.as_ref(),
            request.return_sql,
        )
        .await;

    match outcome {
        Ok(response) => {
            let result = serde_json::to_value(&response).unwrap_or_default();
            state
                .audit
                .record(user_id.as_deref(), TOOL_QUERY, &params, &result, started)
                .await;
            Ok(Json(response))
        }
        Err(e) => {
            let result = serde_json::json!({"error": e.to_string()});
            state
                .audit
                .record(user_id.as_deref(), TOOL_QUERY, &params, &result, started)
                .await;
            Err(e)
        }
    }
}

/// Invalidate and rebuild the in-memory synonym table
/// POST /api/synonyms/refresh
#[utoipa::path(
    post,
    path = "/api/synonyms/refresh",
    responses((status = 204, description = "Synonym table reloaded")),
    tag = "Query"
)]
pub async fn refresh_synonyms(State(state): State<Arc<AppState>>) -> StatusCode {
    state.expander.refresh().await;
    StatusCode::NO_CONTENT
}
