//! VLM service wire contracts
//!
//! Request/response shapes for the external vision-language service: job
//! submission, status polling, webhook delivery, mapping validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Quick,
    Standard,
    Detailed,
}

/// Options forwarded verbatim to the VLM service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmJobOptions {
    pub analysis_depth: AnalysisDepth,
    pub output_language: String,
    pub include_ocr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_visual_reasoning: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    pub max_tokens: u32,
}

impl Default for VlmJobOptions {
    fn default() -> Self {
        Self {
            analysis_depth: AnalysisDepth::Standard,
            output_language: "zh".to_string(),
            include_ocr: true,
            include_visual_reasoning: None,
            confidence_threshold: None,
            max_tokens: 2048,
        }
    }
}

/// Response to a job submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub estimated_duration: Option<f64>,
    #[serde(default)]
    pub check_status_url: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Result of one analysis job. For single-image analysis the per-image fields
/// are set; for mapping validation `validations` carries the per-image verdicts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VlmResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub defect_type: Option<String>,
    #[serde(default)]
    pub equipment_part: Option<String>,
    #[serde(default)]
    pub text_in_image: Option<String>,
    #[serde(default)]
    pub visual_annotations: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub validations: Vec<RawMappingValidation>,
}

/// GET /api/v1/jobs/{job_id}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmJobStatus {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub result: Option<VlmResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Webhook payload posted by the VLM service on job completion
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VlmWebhookPayload {
    pub event: String,
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

/// Result of an image-similarity comparison
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VlmCompareResult {
    #[serde(default)]
    pub comparison_type: String,
    #[serde(default)]
    pub results: Vec<CompareEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareEntry {
    pub filename: String,
    pub similarity: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmHealth {
    pub status: String,
    #[serde(default)]
    pub model: Option<String>,
}

// ============================================================================
// Mapping validation context
// ============================================================================

/// Column descriptor shown to the VLM alongside the rendered page
#[derive(Debug, Clone, Serialize)]
pub struct ColumnDescriptor {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

pub fn mapping_columns() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor { id: "no", label: "NO", description: "Issue number" },
        ColumnDescriptor { id: "type", label: "型试", description: "Trial version" },
        ColumnDescriptor { id: "item", label: "项目", description: "Category" },
        ColumnDescriptor { id: "problem", label: "問題点", description: "Problem description" },
        ColumnDescriptor { id: "solution", label: "原因，对策", description: "Cause and solution" },
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingRow {
    pub row_id: String,
    pub values: MappingRowValues,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingRowValues {
    pub no: String,
    #[serde(rename = "type")]
    pub trial: Option<String>,
    pub item: Option<String>,
    pub problem: String,
    pub solution: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingImage {
    pub image_id: String,
    pub filename: Option<String>,
    pub file_path: String,
    pub anchor_row: u32,
    pub anchor_col: u32,
    pub current_mapping: CurrentMapping,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentMapping {
    pub row_id: String,
    pub problem: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingContext {
    pub case_id: String,
    pub page_number: u32,
    pub total_pages: usize,
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<MappingRow>,
    pub images: Vec<MappingImage>,
}

/// Verdict for one image as returned by the VLM, normalized: mappings flatten
/// to row ids, confidence may be on a 0-1 or 0-100 scale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMappingValidation {
    pub image_id: Option<String>,
    #[serde(default)]
    pub current_mapping: Option<serde_json::Value>,
    #[serde(default)]
    pub validated_mapping: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Normalized verdict consumed by the correction engine
#[derive(Debug, Clone, Default)]
pub struct MappingVerdict {
    pub image_id: String,
    pub current_mapping: Option<String>,
    pub validated_mapping: Option<String>,
    pub status: String,
    pub confidence: f64,
    pub reason: String,
    pub page_number: u32,
}

impl MappingVerdict {
    /// Confidence on the [0, 1] scale regardless of what the VLM returned
    pub fn confidence_ratio(&self) -> f64 {
        if self.confidence > 1.0 { self.confidence / 100.0 } else { self.confidence }
    }
}
