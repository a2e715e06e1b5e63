//! Ingestion pipeline: extract -> map -> validate -> enrich -> index.
//!
//! Mapping validation and VLM enrichment are optional stages; either can be
//! disabled per call. Indexing always runs delete-first so re-ingesting the
//! same file is idempotent.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::IngestionConfig;
use crate::models::Case;
use crate::services::extractor::CaseExtractor;
use crate::services::indexer::{CaseIndexer, IndexStats};
use crate::services::validation::ValidationPipeline;
use crate::services::vlm::{VlmEnricher, VlmService};
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    /// Only keep the first N issues
    pub limit: Option<usize>,
    pub validate_mappings: bool,
    pub vlm_enrich: bool,
    pub auto_correct_threshold: Option<f64>,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self { limit: None, validate_mappings: false, vlm_enrich: false, auto_correct_threshold: None }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestReport {
    pub case_id: String,
    pub total_issues: usize,
    pub total_images: usize,
    pub enriched_images: usize,
    pub auto_corrected: usize,
    pub pending_review: usize,
    pub index_stats: IndexStats,
}

pub struct IngestionPipeline {
    extractor: CaseExtractor,
    vlm: Arc<dyn VlmService>,
    indexer: Arc<CaseIndexer>,
    config: IngestionConfig,
    vlm_job_timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(
        vlm: Arc<dyn VlmService>,
        indexer: Arc<CaseIndexer>,
        config: IngestionConfig,
        vlm_job_timeout: Duration,
    ) -> ApiResult<Self> {
        let extractor = CaseExtractor::new(&config.output_dir)
            .map_err(|e| ApiError::internal_error(format!("failed to create output dir: {}", e)))?;
        Ok(Self { extractor, vlm, indexer, config, vlm_job_timeout })
    }

    pub async fn ingest_case(
        &self,
        spreadsheet: &Path,
        options: &IngestionOptions,
    ) -> ApiResult<IngestReport> {
        let mut case = self.extractor.extract_case(spreadsheet)?;

        if let Some(limit) = options.limit {
            truncate_issues(&mut case, limit);
        }

        let mut auto_corrected = 0;
        let mut pending_review = 0;
        if options.validate_mappings {
            let mut config = self.config.clone();
            if let Some(threshold) = options.auto_correct_threshold {
                config.auto_correct_threshold = threshold;
            }
            let pipeline =
                ValidationPipeline::new(Arc::clone(&self.vlm), &config, self.vlm_job_timeout);
            let summary = pipeline.validate_case(spreadsheet, &mut case).await;
            auto_corrected = summary.auto_corrected;
            pending_review = summary.pending_review;
        }

        let mut enriched_images = 0;
        if options.vlm_enrich {
            let enricher = VlmEnricher::new(
                Arc::clone(&self.vlm),
                self.config.max_concurrent_vlm,
                self.vlm_job_timeout,
            );
            enriched_images = enricher.enrich_case(&mut case).await;
        }

        // persist the final state of the case next to its images
        self.extractor.save_case_json(&case)?;

        let index_stats = self.indexer.index_case(&case, true).await?;

        Ok(IngestReport {
            case_id: case.case_id.clone(),
            total_issues: case.total_issues,
            total_images: case.image_count(),
            enriched_images,
            auto_corrected,
            pending_review,
            index_stats,
        })
    }
}

fn truncate_issues(case: &mut Case, limit: usize) {
    if case.issues.len() > limit {
        tracing::info!(
            "Limiting case {} to the first {} of {} issues",
            case.case_id,
            limit,
            case.issues.len()
        );
        case.issues.truncate(limit);
        case.total_issues = case.issues.len();
        case.validation.total_images = case.image_count();
    }
}
