//! Correction engine: applies VLM mapping verdicts to a case.
//!
//! Confirmed mappings are marked validated; corrections at or above the
//! auto-correct threshold move the image to the validated issue; everything
//! else keeps the anchor-based mapping and lands in the review queue. An
//! image transiently attached to several issues is collapsed to a single
//! instance in the target issue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Case, ImageRef, MappingMethod, MappingStatus, MappingVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionStatus {
    Confirmed,
    AutoCorrected,
    Flagged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingCorrection {
    pub image_id: String,
    pub page_number: u32,
    pub original_row_id: String,
    pub original_problem: String,
    pub validated_row_id: String,
    pub validated_problem: String,
    pub confidence: f64,
    pub reason: String,
    pub status: CorrectionStatus,
    pub corrected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CorrectionSummary {
    pub auto_corrected: usize,
    pub pending_review: usize,
    pub corrections: Vec<MappingCorrection>,
}

pub fn apply_corrections(
    case: &mut Case,
    verdicts: &[MappingVerdict],
    auto_correct_threshold: f64,
) -> CorrectionSummary {
    let mut summary = CorrectionSummary::default();

    for verdict in verdicts {
        if verdict.image_id.is_empty() {
            continue;
        }

        let instances = find_instances(case, &verdict.image_id);
        if instances.is_empty() {
            continue;
        }

        // prefer the instance the VLM was shown as the current mapping
        let current_idx = verdict
            .current_mapping
            .as_ref()
            .and_then(|row_id| {
                instances
                    .iter()
                    .position(|(issue_idx, _)| case.issues[*issue_idx].row_id == *row_id)
            })
            .unwrap_or(0);
        let (current_issue_idx, _) = instances[current_idx];
        let original_row_id = case.issues[current_issue_idx].row_id.clone();
        let original_problem = case.issues[current_issue_idx].problem.clone();

        let confirmed = verdict.status == "confirmed"
            || verdict.validated_mapping.as_deref() == Some(original_row_id.as_str());

        if confirmed {
            move_image_to(case, &verdict.image_id, current_issue_idx);
            mark_image(
                case,
                current_issue_idx,
                &verdict.image_id,
                MappingStatus::Validated,
                MappingMethod::VlmConfirmed,
                verdict,
            );
            summary.corrections.push(correction(
                verdict,
                &original_row_id,
                &original_problem,
                &original_row_id,
                &original_problem,
                CorrectionStatus::Confirmed,
            ));
            continue;
        }

        let target_idx = verdict
            .validated_mapping
            .as_ref()
            .and_then(|row_id| case.issues.iter().position(|issue| issue.row_id == *row_id));

        match target_idx {
            Some(target_idx) if verdict.confidence_ratio() >= auto_correct_threshold => {
                let validated_row_id = case.issues[target_idx].row_id.clone();
                let validated_problem = case.issues[target_idx].problem.clone();
                move_image_to(case, &verdict.image_id, target_idx);
                mark_image(
                    case,
                    target_idx,
                    &verdict.image_id,
                    MappingStatus::Validated,
                    MappingMethod::VlmCorrected,
                    verdict,
                );
                summary.auto_corrected += 1;
                summary.corrections.push(correction(
                    verdict,
                    &original_row_id,
                    &original_problem,
                    &validated_row_id,
                    &validated_problem,
                    CorrectionStatus::AutoCorrected,
                ));
            }
            Some(target_idx) => {
                // plausible correction below the threshold: keep the original
                // mapping and queue for human review
                let validated_row_id = case.issues[target_idx].row_id.clone();
                let validated_problem = case.issues[target_idx].problem.clone();
                move_image_to(case, &verdict.image_id, current_issue_idx);
                mark_image(
                    case,
                    current_issue_idx,
                    &verdict.image_id,
                    MappingStatus::ReviewRequired,
                    MappingMethod::VlmCorrected,
                    verdict,
                );
                summary.pending_review += 1;
                summary.corrections.push(correction(
                    verdict,
                    &original_row_id,
                    &original_problem,
                    &validated_row_id,
                    &validated_problem,
                    CorrectionStatus::Flagged,
                ));
            }
            None => {
                // validated row unknown to the case: flag without moving
                move_image_to(case, &verdict.image_id, current_issue_idx);
                mark_image(
                    case,
                    current_issue_idx,
                    &verdict.image_id,
                    MappingStatus::ReviewRequired,
                    MappingMethod::VlmCorrected,
                    verdict,
                );
                summary.pending_review += 1;
                summary.corrections.push(correction(
                    verdict,
                    &original_row_id,
                    &original_problem,
                    verdict.validated_mapping.as_deref().unwrap_or(""),
                    "",
                    CorrectionStatus::Flagged,
                ));
            }
        }
    }

    for issue in &mut case.issues {
        issue.refresh_mapping_status();
    }

    summary
}

fn correction(
    verdict: &MappingVerdict,
    original_row_id: &str,
    original_problem: &str,
    validated_row_id: &str,
    validated_problem: &str,
    status: CorrectionStatus,
) -> MappingCorrection {
    MappingCorrection {
        image_id: verdict.image_id.clone(),
        page_number: verdict.page_number,
        original_row_id: original_row_id.to_string(),
        original_problem: original_problem.to_string(),
        validated_row_id: validated_row_id.to_string(),
        validated_problem: validated_problem.to_string(),
        confidence: verdict.confidence_ratio(),
        reason: verdict.reason.clone(),
        status,
        corrected_at: Utc::now(),
    }
}

fn find_instances(case: &Case, image_id: &str) -> Vec<(usize, usize)> {
    let mut instances = Vec::new();
    for (issue_idx, issue) in case.issues.iter().enumerate() {
        for (image_idx, image) in issue.images.iter().enumerate() {
            if image.image_id == image_id {
                instances.push((issue_idx, image_idx));
            }
        }
    }
    instances
}

/// Remove every instance of an image and attach a single one to the target
/// issue. The final state is a partition of images over issues.
fn move_image_to(case: &mut Case, image_id: &str, target_issue_idx: usize) {
    let mut kept: Option<ImageRef> = None;
    for issue in &mut case.issues {
        let mut idx = 0;
        while idx < issue.images.len() {
            if issue.images[idx].image_id == image_id {
                let removed = issue.images.remove(idx);
                if kept.is_none() {
                    kept = Some(removed);
                }
            } else {
                idx += 1;
            }
        }
    }
    if let Some(image) = kept {
        case.issues[target_issue_idx].images.push(image);
    }
}

fn mark_image(
    case: &mut Case,
    issue_idx: usize,
    image_id: &str,
    status: MappingStatus,
    method: MappingMethod,
    verdict: &MappingVerdict,
) {
    if let Some(image) = case.issues[issue_idx]
        .images
        .iter_mut()
        .find(|img| img.image_id == image_id)
    {
        image.mapping_validation.status = status;
        image.mapping_validation.method = method;
        image.mapping_validation.confidence = verdict.confidence_ratio();
        image.mapping_validation.reason =
            (!verdict.reason.is_empty()).then(|| verdict.reason.clone());
        image.mapping_validation.validated_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Anchor, CaseMetadata, Issue, MappingStatusCounts, MappingValidation, ValidationSummary,
        VlAnalysis,
    };

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

    fn issue(number: i32, row_id: &str, excel_row: u32, problem: &str, images: Vec<ImageRef>) -> Issue {
        Issue {
            issue_number: number,
            row_id: row_id.into(),
            excel_row,
            trial_version: None,
            category: None,
            problem: problem.into(),
            solution: String::new(),
            result_t1: None,
            result_t2: None,
            cause_classification: None,
            images,
            image_mapping_status: MappingStatusCounts::default(),
        }
    }

    fn case_with(issues: Vec<Issue>) -> Case {
        let total_issues = issues.len();
        Case {
            case_id: "TS-1-1".into(),
            metadata: CaseMetadata::default(),
            issues,
            total_issues,
            source_file: "case.xlsx".into(),
            vlm_processed: false,
            vlm_summary: None,
            vlm_confidence: 0.0,
            tags: Vec::new(),
            key_insights: Vec::new(),
            validation: ValidationSummary::default(),
        }
    }

    fn verdict(
        image_id: &str,
        current: &str,
        validated: &str,
        status: &str,
        confidence: f64,
    ) -> MappingVerdict {
        MappingVerdict {
            image_id: image_id.into(),
            current_mapping: Some(current.into()),
            validated_mapping: Some(validated.into()),
            status: status.into(),
            confidence,
            reason: "page reading".into(),
            page_number: 1,
        }
    }

    #[test]
    fn confirmed_mapping_marked_vlm_confirmed() {
        let mut case = case_with(vec![issue(1, "r1", 40, "披锋", vec![image("img002")])]);
        let summary =
            apply_corrections(&mut case, &[verdict("img002", "r1", "r1", "confirmed", 0.97)], 0.90);

        assert_eq!(summary.auto_corrected, 0);
        assert_eq!(summary.pending_review, 0);
        let img = &case.issues[0].images[0];
        assert_eq!(img.mapping_validation.status, MappingStatus::Validated);
        assert_eq!(img.mapping_validation.method, MappingMethod::VlmConfirmed);
    }

    #[test]
    fn high_confidence_correction_moves_image() {
        // image on r1 validated to r2 at 0.95 moves and counts as corrected
        let mut case = case_with(vec![
            issue(1, "r1", 40, "披锋", vec![image("img002")]),
            issue(2, "r2", 58, "拉白", vec![]),
        ]);
        let summary =
            apply_corrections(&mut case, &[verdict("img002", "r1", "r2", "corrected", 0.95)], 0.90);

        assert_eq!(summary.auto_corrected, 1);
        assert_eq!(summary.pending_review, 0);
        assert!(case.issues[0].images.is_empty());
        assert_eq!(case.issues[1].images.len(), 1);
        let img = &case.issues[1].images[0];
        assert_eq!(img.mapping_validation.status, MappingStatus::Validated);
        assert_eq!(img.mapping_validation.method, MappingMethod::VlmCorrected);
        assert_eq!(case.issues[1].image_mapping_status.validated, 1);
    }

    #[test]
    fn low_confidence_correction_keeps_mapping_and_flags() {
        let mut case = case_with(vec![
            issue(1, "r1", 40, "披锋", vec![image("img002")]),
            issue(2, "r2", 58, "拉白", vec![]),
        ]);
        let summary =
            apply_corrections(&mut case, &[verdict("img002", "r1", "r2", "corrected", 0.60)], 0.90);

        assert_eq!(summary.auto_corrected, 0);
        assert_eq!(summary.pending_review, 1);
        assert_eq!(case.issues[0].images.len(), 1);
        assert!(case.issues[1].images.is_empty());
        assert_eq!(
            case.issues[0].images[0].mapping_validation.status,
            MappingStatus::ReviewRequired
        );
    }

    #[test]
    fn unknown_validated_row_flags_without_moving() {
        let mut case = case_with(vec![issue(1, "r1", 40, "披锋", vec![image("img002")])]);
        let summary =
            apply_corrections(&mut case, &[verdict("img002", "r1", "r9", "corrected", 0.99)], 0.90);

        assert_eq!(summary.pending_review, 1);
        assert_eq!(case.issues[0].images.len(), 1);
    }

    #[test]
    fn percent_scale_confidence_is_normalized() {
        let mut case = case_with(vec![
            issue(1, "r1", 40, "披锋", vec![image("img002")]),
            issue(2, "r2", 58, "拉白", vec![]),
        ]);
        let summary =
            apply_corrections(&mut case, &[verdict("img002", "r1", "r2", "corrected", 95.0)], 0.90);
        assert_eq!(summary.auto_corrected, 1);
        assert_eq!(case.issues[1].images.len(), 1);
    }

    #[test]
    fn duplicated_instances_collapse_to_one() {
        let mut case = case_with(vec![
            issue(1, "r1", 40, "披锋", vec![image("img002")]),
            issue(2, "r2", 58, "拉白", vec![image("img002")]),
        ]);
        apply_corrections(&mut case, &[verdict("img002", "r1", "r2", "corrected", 0.95)], 0.90);

        let total: usize = case.issues.iter().map(|i| i.images.len()).sum();
        assert_eq!(total, 1);
        assert_eq!(case.issues[1].images.len(), 1);
    }
}
