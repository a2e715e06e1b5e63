//! Per-image VLM enrichment.
//!
//! Submissions fan out under a bounded semaphore; each image is isolated so a
//! single failed analysis leaves that image with empty VL fields and the case
//! proceeds. Issue- and case-level rollups are recomputed afterwards.

use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::models::{Case, Severity, VlAnalysis, VlmJobOptions, VlmResult};
use crate::utils::ApiResult;

use super::client::VlmService;

const ENRICH_TEMPLATE: &str = "mold_defect_analysis";

pub struct VlmEnricher {
    vlm: Arc<dyn VlmService>,
    max_concurrent: usize,
    job_timeout: Duration,
    language: String,
}

impl VlmEnricher {
    pub fn new(vlm: Arc<dyn VlmService>, max_concurrent: usize, job_timeout: Duration) -> Self {
        Self { vlm, max_concurrent, job_timeout, language: "zh".to_string() }
    }

    /// Analyze every attached image and fold results into the case.
    /// Returns the number of successfully analyzed images.
    pub async fn enrich_case(&self, case: &mut Case) -> usize {
        let targets: Vec<(usize, usize, PathBuf)> = case
            .issues
            .iter()
            .enumerate()
            .flat_map(|(issue_idx, issue)| {
                issue
                    .images
                    .iter()
                    .enumerate()
                    .map(move |(image_idx, img)| {
                        (issue_idx, image_idx, PathBuf::from(&img.file_path))
                    })
            })
            .collect();

        if targets.is_empty() {
            return 0;
        }

        tracing::info!(
            "Enriching {} images for case {} ({} in flight)",
            targets.len(),
            case.case_id,
            self.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let tasks = targets.into_iter().map(|(issue_idx, image_idx, path)| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let result = self.analyze_image(&path).await;
                (issue_idx, image_idx, result)
            }
        });

        let results = join_all(tasks).await;

        let mut analyzed = 0;
        for (issue_idx, image_idx, result) in results {
            let image = &mut case.issues[issue_idx].images[image_idx];
            match result {
                Ok(vlm_result) => {
                    image.vl = analysis_from_result(vlm_result);
                    analyzed += 1;
                }
                Err(e) => {
                    tracing::warn!("VLM analysis failed for {}: {}", image.image_id, e);
                    image.vl = VlAnalysis::default();
                }
            }
        }

        self.rollup_case(case, analyzed);
        analyzed
    }

    async fn analyze_image(&self, path: &PathBuf) -> ApiResult<VlmResult> {
        let options = VlmJobOptions {
            output_language: self.language.clone(),
            ..VlmJobOptions::default()
        };
        let job = self
            .vlm
            .submit_file(path, Some(ENRICH_TEMPLATE), Some(&options))
            .await?;
        self.vlm.wait_for_result(&job.job_id, self.job_timeout).await
    }

    fn rollup_case(&self, case: &mut Case, analyzed: usize) {
        case.vlm_processed = analyzed > 0;
        case.vlm_confidence = case
            .issues
            .iter()
            .map(|issue| issue.max_vlm_confidence())
            .fold(0.0, f64::max);

        let mut tags = Vec::new();
        let mut insights = Vec::new();
        for issue in &case.issues {
            for tag in issue.aggregated_tags() {
                if !tags.contains(&tag) && tags.len() < 10 {
                    tags.push(tag);
                }
            }
            for insight in issue.aggregated_insights() {
                if !insights.contains(&insight) && insights.len() < 5 {
                    insights.push(insight);
                }
            }
        }
        case.tags = tags;
        case.key_insights = insights;

        if case.vlm_summary.is_none() && !case.key_insights.is_empty() {
            case.vlm_summary = Some(case.key_insights.join(" "));
        }
    }
}

fn analysis_from_result(result: VlmResult) -> VlAnalysis {
    VlAnalysis {
        description: result.description,
        defect_type: result.defect_type,
        equipment_part: result.equipment_part,
        text_in_image: result.text_in_image,
        visual_annotations: result.visual_annotations,
        severity: result.severity.as_deref().and_then(Severity::parse),
        tags: result.tags,
        key_insights: result.key_insights,
        suggested_actions: result.suggested_actions,
        vlm_confidence: result.confidence.unwrap_or(0.0),
    }
}
