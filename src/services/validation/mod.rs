//! VLM mapping validation pipeline.
//!
//! Renders the spreadsheet to page images, submits each page that carries at
//! least one issue and one image to the VLM together with the extracted
//! images and a mapping-context payload, and applies the verdicts through the
//! correction engine. Any terminal failure leaves the anchor-based mappings
//! in place and marks the case validation as failed - ingestion never aborts
//! here.

pub mod corrections;
pub mod page_renderer;
pub mod review_queue;

pub use corrections::{CorrectionStatus, CorrectionSummary, MappingCorrection, apply_corrections};
pub use page_renderer::{PageRenderer, compute_page_ranges, page_for_row};
pub use review_queue::ReviewQueue;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::IngestionConfig;
use crate::models::vlm::{AnalysisDepth, mapping_columns};
use crate::models::{
    Case, MappingContext, MappingImage, MappingRow, MappingVerdict, ValidationStatus,
    VlmJobOptions,
};
use crate::models::vlm::{CurrentMapping, MappingRowValues, RawMappingValidation};
use crate::services::vlm::VlmService;
use crate::utils::ApiResult;

pub struct ValidationPipeline {
    vlm: Arc<dyn VlmService>,
    output_dir: PathBuf,
    auto_correct_threshold: f64,
    max_retries: u32,
    job_timeout: Duration,
    dpi: u32,
    rows_per_page: u32,
    libreoffice_path: Option<String>,
}

impl ValidationPipeline {
    pub fn new(vlm: Arc<dyn VlmService>, config: &IngestionConfig, job_timeout: Duration) -> Self {
        Self {
            vlm,
            output_dir: PathBuf::from(&config.output_dir),
            auto_correct_threshold: config.auto_correct_threshold,
            max_retries: config.max_retries,
            job_timeout,
            dpi: config.page_render_dpi,
            rows_per_page: config.rows_per_page,
            libreoffice_path: config.libreoffice_path.clone(),
        }
    }

    /// Validate image mappings for a case; updates the case in place.
    pub async fn validate_case(&self, spreadsheet: &Path, case: &mut Case) -> CorrectionSummary {
        tracing::info!("VLM mapping validation for case {}", case.case_id);

        match self.run(spreadsheet, case).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!("VLM validation failed for {}: {}", case.case_id, e);
                case.validation.status = ValidationStatus::Failed;
                case.validation.validated_at = None;
                CorrectionSummary::default()
            }
        }
    }

    async fn run(&self, spreadsheet: &Path, case: &mut Case) -> ApiResult<CorrectionSummary> {
        let render_dir = self.output_dir.join("validation").join(&case.case_id);
        let renderer = PageRenderer::new(
            render_dir,
            self.dpi,
            self.rows_per_page,
            self.libreoffice_path.clone(),
        );
        let rendered = renderer.render(spreadsheet, case).await?;
        let total_pages = rendered.page_images.len();

        let mut verdicts: Vec<MappingVerdict> = Vec::new();
        let mut pages_processed = 0usize;

        let mut page_numbers: Vec<u32> = rendered.page_context.keys().copied().collect();
        page_numbers.sort_unstable();

        for page_number in page_numbers {
            let context = &rendered.page_context[&page_number];
            if context.rows.is_empty() || context.images.is_empty() {
                continue;
            }
            let Some(page_image) = rendered.page_images.get(page_number as usize - 1) else {
                continue;
            };

            let mapping_context =
                build_mapping_context(case, page_number, total_pages, &context.rows, &context.images);
            let image_paths: Vec<PathBuf> = mapping_context
                .images
                .iter()
                .map(|img| PathBuf::from(&img.file_path))
                .collect();

            match self
                .validate_page(page_image, &image_paths, &mapping_context, page_number)
                .await
            {
                Ok(mut page_verdicts) => {
                    pages_processed += 1;
                    verdicts.append(&mut page_verdicts);
                }
                Err(e) => {
                    // this page keeps its anchor-based mappings
                    tracing::warn!("Validation failed on page {}: {}", page_number, e);
                    case.validation.status = ValidationStatus::Failed;
                }
            }
        }

        let summary = apply_corrections(case, &verdicts, self.auto_correct_threshold);

        if summary.pending_review > 0 {
            let queue = ReviewQueue::new(self.output_dir.join("review_queue"));
            if let Err(e) = queue.save_case_reviews(&case.case_id, &summary.corrections) {
                tracing::warn!("Failed to write review queue: {}", e);
            }
        }

        let confidences: Vec<f64> = verdicts.iter().map(|v| v.confidence_ratio()).collect();
        let average_confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };

        if case.validation.status != ValidationStatus::Failed {
            case.validation.status = ValidationStatus::Completed;
        }
        case.validation.validated_at = Some(Utc::now());
        case.validation.pages_processed = pages_processed;
        case.validation.total_images = case.image_count();
        case.validation.auto_corrected = summary.auto_corrected;
        case.validation.pending_review = summary.pending_review;
        case.validation.average_confidence = average_confidence;

        Ok(summary)
    }

    async fn validate_page(
        &self,
        page_image: &Path,
        image_paths: &[PathBuf],
        mapping_context: &MappingContext,
        page_number: u32,
    ) -> ApiResult<Vec<MappingVerdict>> {
        let options = VlmJobOptions {
            analysis_depth: AnalysisDepth::Detailed,
            output_language: "zh".to_string(),
            include_ocr: true,
            include_visual_reasoning: Some(true),
            confidence_threshold: Some(self.auto_correct_threshold),
            max_tokens: 2048,
        };

        let mut last_error = None;
        for attempt in 1..=(self.max_retries + 1) {
            let result: ApiResult<Vec<MappingVerdict>> = async {
                let job = self
                    .vlm
                    .validate_mappings(page_image, image_paths, mapping_context, &options)
                    .await?;
                let result = self.vlm.wait_for_result(&job.job_id, self.job_timeout).await?;
                Ok(result
                    .validations
                    .into_iter()
                    .filter_map(|raw| normalize_validation(raw, page_number))
                    .collect())
            }
            .await;

            match result {
                Ok(verdicts) => return Ok(verdicts),
                Err(e) => {
                    tracing::warn!(
                        "VLM validation attempt {} failed on page {}: {}",
                        attempt,
                        page_number,
                        e
                    );
                    last_error = Some(e);
                    if attempt <= self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        Err(last_error.expect("at least one attempt"))
    }
}

fn build_mapping_context(
    case: &Case,
    page_number: u32,
    total_pages: usize,
    row_ids: &[String],
    image_ids: &[String],
) -> MappingContext {
    let rows = row_ids
        .iter()
        .filter_map(|row_id| case.find_issue_by_row_id(row_id))
        .map(|issue| MappingRow {
            row_id: issue.row_id.clone(),
            values: MappingRowValues {
                no: issue.issue_number.to_string(),
                trial: issue.trial_version.clone(),
                item: issue.category.clone(),
                problem: issue.problem.clone(),
                solution: issue.solution.clone(),
            },
        })
        .collect();

    let mut images = Vec::new();
    for issue in &case.issues {
        for image in &issue.images {
            if image_ids.contains(&image.image_id) {
                images.push(MappingImage {
                    image_id: image.image_id.clone(),
                    filename: Path::new(&image.file_path)
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(str::to_string),
                    file_path: image.file_path.clone(),
                    anchor_row: image.anchor.row_start,
                    anchor_col: image.anchor.col_start,
                    current_mapping: CurrentMapping {
                        row_id: issue.row_id.clone(),
                        problem: issue.problem.clone(),
                    },
                });
            }
        }
    }

    MappingContext {
        case_id: case.case_id.clone(),
        page_number,
        total_pages,
        columns: mapping_columns(),
        rows,
        images,
    }
}

/// Flatten a raw VLM validation entry: mappings may arrive as plain row ids
/// or as {row_id, problem} objects.
fn normalize_validation(raw: RawMappingValidation, page_number: u32) -> Option<MappingVerdict> {
    let image_id = raw.image_id?;

    fn row_id_of(value: &serde_json::Value) -> Option<String> {
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Object(map) => {
                map.get("row_id").and_then(|v| v.as_str()).map(str::to_string)
            }
            _ => None,
        }
    }

    Some(MappingVerdict {
        image_id,
        current_mapping: raw.current_mapping.as_ref().and_then(row_id_of),
        validated_mapping: raw.validated_mapping.as_ref().and_then(row_id_of),
        status: raw.status.unwrap_or_default(),
        confidence: raw.confidence.unwrap_or(0.0),
        reason: raw.reasoning.unwrap_or_default(),
        page_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_accepts_plain_and_object_mappings() {
        let raw = RawMappingValidation {
            image_id: Some("img002".into()),
            current_mapping: Some(json!("r1")),
            validated_mapping: Some(json!({"row_id": "r2", "problem": "拉白"})),
            status: Some("corrected".into()),
            confidence: Some(0.95),
            reasoning: Some("image shows whitening".into()),
        };
        let verdict = normalize_validation(raw, 3).unwrap();
        assert_eq!(verdict.current_mapping.as_deref(), Some("r1"));
        assert_eq!(verdict.validated_mapping.as_deref(), Some("r2"));
        assert_eq!(verdict.page_number, 3);
        assert!((verdict.confidence_ratio() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn normalize_drops_entries_without_image_id() {
        let raw = RawMappingValidation::default();
        assert!(normalize_validation(raw, 1).is_none());
    }
}
