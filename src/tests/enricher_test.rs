// Per-image VLM enrichment: bounded fan-out with per-image error isolation
// and issue/case rollups.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::models::{
    Anchor, Case, CaseMetadata, ImageRef, Issue, MappingStatusCounts, MappingValidation,
    Severity, ValidationSummary, VlAnalysis, VlmResult,
};
use crate::services::vlm::VlmEnricher;

use super::common::FakeVlm;

fn image(id: &str) -> ImageRef {
    ImageRef {
        image_id: id.into(),
        file_path: format!("/tmp/{}.jpg", id),
        anchor: Anchor::default(),
        spatial_match: None,
        mapping_validation: MappingValidation::default(),
        vl: VlAnalysis::default(),
    }
}

fn case_with_images(images_per_issue: Vec<Vec<ImageRef>>) -> Case {
    let issues: Vec<Issue> = images_per_issue
        .into_iter()
        .enumerate()
        .map(|(idx, images)| Issue {
            issue_number: idx as i32 + 1,
            row_id: format!("r{}", idx + 1),
            excel_row: 20 + idx as u32 * 10,
            trial_version: None,
            category: None,
            problem: format!("问题{}", idx + 1),
            solution: String::new(),
            result_t1: None,
            result_t2: None,
            cause_classification: None,
            images,
            image_mapping_status: MappingStatusCounts::default(),
        })
        .collect();

    Case {
        case_id: "TS-1947688-ED736A0501".into(),
        metadata: CaseMetadata::default(),
        total_issues: issues.len(),
        issues,
        source_file: "case.xlsx".into(),
        vlm_processed: false,
        vlm_summary: None,
        vlm_confidence: 0.0,
        tags: Vec::new(),
        key_insights: Vec::new(),
        validation: ValidationSummary::default(),
    }
}

fn result(defect: &str, severity: &str, confidence: f64, tags: &[&str]) -> VlmResult {
    VlmResult {
        description: Some(format!("{}明显", defect)),
        defect_type: Some(defect.into()),
        severity: Some(severity.into()),
        confidence: Some(confidence),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        key_insights: vec![format!("{}需要改善", defect)],
        ..VlmResult::default()
    }
}

#[tokio::test]
async fn all_images_enriched_and_rolled_up() {
    let vlm = FakeVlm::default();
    vlm.script("img_a", Ok(result("披锋", "high", 0.92, &["飞边"])));
    vlm.script("img_b", Ok(result("缩水", "low", 0.70, &["凹陷"])));

    let mut case = case_with_images(vec![vec![image("img_a")], vec![image("img_b")]]);
    let enricher = VlmEnricher::new(Arc::new(vlm), 4, Duration::from_secs(1));

    let enriched = enricher.enrich_case(&mut case).await;

    assert_eq!(enriched, 2);
    assert!(case.vlm_processed);
    assert_eq!(case.issues[0].images[0].vl.defect_type.as_deref(), Some("披锋"));
    assert_eq!(case.issues[0].max_severity(), Some(Severity::High));
    assert!((case.vlm_confidence - 0.92).abs() < f64::EPSILON);
    assert!(case.tags.contains(&"飞边".to_string()));
    assert!(case.key_insights.iter().any(|i| i.contains("披锋")));
}

#[tokio::test]
async fn one_failed_image_never_aborts_the_case() {
    let vlm = FakeVlm::default();
    vlm.script("img_a", Ok(result("披锋", "medium", 0.8, &[])));
    vlm.script("img_b", Err("model overloaded".into()));

    let mut case = case_with_images(vec![vec![image("img_a"), image("img_b")]]);
    let enricher = VlmEnricher::new(Arc::new(vlm), 2, Duration::from_secs(1));

    let enriched = enricher.enrich_case(&mut case).await;

    assert_eq!(enriched, 1);
    assert!(case.vlm_processed);
    // failed image keeps empty VL fields
    let failed = &case.issues[0].images[1].vl;
    assert!(failed.defect_type.is_none());
    assert_eq!(failed.vlm_confidence, 0.0);
    // the successful sibling still contributes to the rollup
    assert_eq!(case.issues[0].max_severity(), Some(Severity::Medium));
}

#[tokio::test]
async fn every_image_is_submitted_exactly_once() {
    let vlm = Arc::new(FakeVlm::default());
    for idx in 0..9 {
        vlm.script(&format!("img_{}", idx), Ok(result("披锋", "low", 0.5, &[])));
    }

    let images: Vec<ImageRef> = (0..9).map(|idx| image(&format!("img_{}", idx))).collect();
    let mut case = case_with_images(vec![images]);

    let enricher =
        VlmEnricher::new(Arc::clone(&vlm) as Arc<dyn crate::services::vlm::VlmService>, 3, Duration::from_secs(1));
    let enriched = enricher.enrich_case(&mut case).await;

    assert_eq!(enriched, 9);
    assert_eq!(vlm.submissions.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn case_without_images_is_untouched() {
    let vlm = FakeVlm::default();
    let mut case = case_with_images(vec![vec![]]);
    let enricher = VlmEnricher::new(Arc::new(vlm), 4, Duration::from_secs(1));

    assert_eq!(enricher.enrich_case(&mut case).await, 0);
    assert!(!case.vlm_processed);
}
