use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// API Error with rich context and automatic error trait implementations
///
/// Design: Uses thiserror for ergonomic error handling with context.
/// Each variant carries meaningful context to help with debugging.
#[derive(Error, Debug)]
pub enum ApiError {
    // Authentication / authorization errors 1xxx
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: tool '{tool}' requires one of roles [{required}]")]
    PermissionDenied { tool: String, required: String },

    // Extraction errors 2xxx
    #[error("Spreadsheet not found: {0}")]
    SpreadsheetNotFound(String),

    #[error("Failed to read spreadsheet {file}: {message}")]
    ExtractionFailed { file: String, message: String },

    #[error("No data table header found in {0}")]
    MissingDataHeader(String),

    #[error("Spreadsheet {0} contains no issue rows")]
    EmptySheet(String),

    // External dependency errors 3xxx
    #[error("Dependency '{service}' unavailable: {message}")]
    DependencyUnavailable { service: String, message: String },

    #[error("Timed out waiting for {what} after {seconds}s")]
    Timeout { what: String, seconds: u64 },

    #[error("VLM job {job_id} failed: {message}")]
    VlmJobFailed { job_id: String, message: String },

    // Validation errors 4xxx
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("SQL safety violation: {0}")]
    SqlSafetyViolation(String),

    // Storage errors 5xxx
    #[error("Case {0} already indexed; pass force_reindex to replace it")]
    CaseConflict(String),

    #[error("Partial write for case {case_id}: {wrote} succeeded, {failed} failed: {message}")]
    PartialWrite { case_id: String, wrote: String, failed: String, message: String },

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    // Database errors - auto-convert from sqlx::Error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Generic wrapper for other errors - auto-convert from anyhow::Error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    /// Helper to create unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Helper to create extraction error
    pub fn extraction_failed(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExtractionFailed { file: file.into(), message: message.into() }
    }

    /// Helper to create dependency error
    pub fn dependency(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DependencyUnavailable { service: service.into(), message: message.into() }
    }

    /// Helper to create timeout error
    pub fn timeout(what: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout { what: what.into(), seconds }
    }

    /// Helper to create validation error
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    /// Helper to create invalid data error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Helper to create invalid SQL error
    pub fn invalid_sql(message: impl Into<String>) -> Self {
        Self::InvalidSql(message.into())
    }

    /// Helper to create SQL safety violation error
    pub fn sql_safety_violation(message: impl Into<String>) -> Self {
        Self::SqlSafetyViolation(message.into())
    }

    /// Helper to create vector store error
    pub fn vector_store(message: impl Into<String>) -> Self {
        Self::VectorStore(message.into())
    }

    /// Helper to create internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Get stable error code grouped by category
    pub fn error_code(&self) -> i32 {
        match self {
            // Authentication / authorization errors 1xxx
            Self::Unauthorized(_) => 1001,
            Self::PermissionDenied { .. } => 1002,

            // Extraction errors 2xxx
            Self::SpreadsheetNotFound(_) => 2001,
            Self::ExtractionFailed { .. } => 2002,
            Self::MissingDataHeader(_) => 2003,
            Self::EmptySheet(_) => 2004,

            // External dependency errors 3xxx
            Self::DependencyUnavailable { .. } => 3001,
            Self::Timeout { .. } => 3002,
            Self::VlmJobFailed { .. } => 3003,

            // Validation errors 4xxx
            Self::ValidationError(_) => 4001,
            Self::InvalidInput(_) => 4002,
            Self::InvalidSql(_) => 4003,
            Self::SqlSafetyViolation(_) => 4004,

            // Storage errors 5xxx
            Self::CaseConflict(_) => 5001,
            Self::PartialWrite { .. } => 5002,
            Self::VectorStore(_) => 5003,
            Self::InternalError(_) => 5004,
            Self::Database(_) => 5005,
            Self::Other(_) => 5004,
        }
    }
}

/// Wire error response
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let message = self.to_string();

        let status = match code {
            1001 => StatusCode::UNAUTHORIZED,
            1002 => StatusCode::FORBIDDEN,
            2001..=2999 => StatusCode::UNPROCESSABLE_ENTITY,
            3002 => StatusCode::GATEWAY_TIMEOUT,
            3001..=3999 => StatusCode::BAD_GATEWAY,
            4001..=4999 => StatusCode::BAD_REQUEST,
            5001 => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let response = ApiErrorResponse { code, message, details: None };

        (status, Json(response)).into_response()
    }
}

/// Implement From for serde_json::Error
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::internal_error(format!("JSON serialization error: {}", err))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
