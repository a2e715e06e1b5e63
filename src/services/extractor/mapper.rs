//! Spatial image-to-issue mapping.
//!
//! Pictures in these sheets sit below their issue row and span several rows,
//! so the issue row is expected above or at the start of the image range. The
//! scoring bands reward proximity; an anchor with a sizable top offset gets a
//! small boost because the picture was placed inside the starting cell rather
//! than on the boundary.

use crate::models::{Anchor, ImageRef, Issue, SpatialMatch, SpatialMatchKind};

/// Anchors with a top offset above this are treated as deliberately placed
/// within the starting cell (EMU units)
const OFFSET_BOOST_THRESHOLD: i64 = 100_000;

/// Outcome of assigning a batch of images to issues
#[derive(Debug, Default)]
pub struct MappingReport {
    pub assigned: usize,
    /// Image ids with no candidate issue; kept on disk but not attached
    pub dropped: Vec<String>,
}

/// Score one (issue row, image anchor) pair. None means no plausible match.
pub fn calculate_match(issue_row: u32, anchor: &Anchor) -> Option<SpatialMatch> {
    let img_row_start = anchor.row_start as i64;
    let img_row_end = (anchor.row_end.max(anchor.row_start)) as i64;
    let issue_row = issue_row as i64;
    let row_span = img_row_end - img_row_start;

    // Issue far below the image belongs to a different issue
    if issue_row > img_row_end + 5 {
        return None;
    }

    let issue_above_image = issue_row < img_row_start;
    let distance_to_image_start = img_row_start - issue_row;

    let (kind, mut confidence) = if issue_above_image {
        if distance_to_image_start <= 3 {
            (SpatialMatchKind::Primary, (1.0 - distance_to_image_start as f64 * 0.10).min(1.0))
        } else if distance_to_image_start <= 8 {
            (SpatialMatchKind::Secondary, (0.85 - distance_to_image_start as f64 * 0.05).max(0.6))
        } else if distance_to_image_start <= 50 {
            (SpatialMatchKind::Tertiary, (0.65 - distance_to_image_start as f64 * 0.01).max(0.4))
        } else {
            return None;
        }
    } else if issue_row >= img_row_start && issue_row <= img_row_end {
        if row_span <= 3 {
            (SpatialMatchKind::Inline, 0.85)
        } else {
            (SpatialMatchKind::Overlap, 0.70)
        }
    } else {
        let distance_below = issue_row - img_row_end;
        (SpatialMatchKind::PostImage, (0.35 - distance_below as f64 * 0.07).max(0.0))
    };

    if anchor.row_offs_top > OFFSET_BOOST_THRESHOLD
        && issue_above_image
        && distance_to_image_start <= 5
    {
        confidence = (confidence + 0.05).min(1.0);
    }

    Some(SpatialMatch {
        kind,
        confidence: round2(confidence),
        row_distance: if issue_above_image { distance_to_image_start } else { 0 },
    })
}

/// Assign each image to its best-matching issue. Images with no candidate are
/// dropped from the issue list (they remain on disk for operators).
pub fn assign_images(issues: &mut [Issue], images: Vec<ImageRef>) -> MappingReport {
    let mut report = MappingReport::default();

    for mut image in images {
        let mut candidates: Vec<(usize, SpatialMatch)> = issues
            .iter()
            .enumerate()
            .filter_map(|(idx, issue)| {
                calculate_match(issue.excel_row, &image.anchor).map(|m| (idx, m))
            })
            .collect();

        if candidates.is_empty() {
            tracing::warn!(
                "Image {} (rows {}-{}) matched no issue, dropping from case",
                image.image_id,
                image.anchor.row_start,
                image.anchor.row_end
            );
            report.dropped.push(image.image_id);
            continue;
        }

        candidates.sort_by(|a, b| {
            b.1.confidence
                .partial_cmp(&a.1.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.row_distance.cmp(&b.1.row_distance))
        });

        let (best_idx, best_match) = candidates.into_iter().next().expect("non-empty candidates");
        image.mapping_validation.confidence = best_match.confidence;
        image.spatial_match = Some(best_match);
        issues[best_idx].images.push(image);
        report.assigned += 1;
    }

    for issue in issues.iter_mut() {
        issue.refresh_mapping_status();
    }

    report
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnchorType, MappingStatusCounts, MappingValidation, VlAnalysis};

    fn anchor(row_start: u32, row_end: u32) -> Anchor {
        Anchor {
            row_start,
            row_end,
            col_start: 2,
            col_end: 6,
            anchor_type: AnchorType::TwoCell,
            ..Anchor::default()
        }
    }

    fn issue_at(number: i32, excel_row: u32) -> Issue {
        Issue {
            issue_number: number,
            row_id: format!("r{}", number),
            excel_row,
            trial_version: None,
            category: None,
            problem: format!("问题{}", number),
            solution: String::new(),
            result_t1: None,
            result_t2: None,
            cause_classification: None,
            images: Vec::new(),
            image_mapping_status: MappingStatusCounts::default(),
        }
    }

    fn image(id: &str, anchor: Anchor) -> ImageRef {
        ImageRef {
            image_id: id.into(),
            file_path: format!("/tmp/{}.jpg", id),
            anchor,
            spatial_match: None,
            mapping_validation: MappingValidation::default(),
            vl: VlAnalysis::default(),
        }
    }

    #[test]
    fn primary_match_close_above() {
        let m = calculate_match(40, &anchor(42, 58)).unwrap();
        assert_eq!(m.kind, SpatialMatchKind::Primary);
        assert_eq!(m.row_distance, 2);
        assert!((m.confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn secondary_and_tertiary_bands() {
        let m = calculate_match(37, &anchor(42, 58)).unwrap();
        assert_eq!(m.kind, SpatialMatchKind::Secondary);
        assert!((m.confidence - 0.6).abs() < f64::EPSILON);

        let m = calculate_match(22, &anchor(42, 58)).unwrap();
        assert_eq!(m.kind, SpatialMatchKind::Tertiary);
        assert!((m.confidence - 0.45).abs() < f64::EPSILON);
    }

    #[test]
    fn no_match_too_far_above_or_below() {
        assert!(calculate_match(1, &anchor(60, 70)).is_none());
        assert!(calculate_match(76, &anchor(60, 70)).is_none());
    }

    #[test]
    fn inline_and_overlap_within_span() {
        let m = calculate_match(43, &anchor(42, 44)).unwrap();
        assert_eq!(m.kind, SpatialMatchKind::Inline);
        assert!((m.confidence - 0.85).abs() < f64::EPSILON);

        let m = calculate_match(50, &anchor(42, 58)).unwrap();
        assert_eq!(m.kind, SpatialMatchKind::Overlap);
        assert!((m.confidence - 0.70).abs() < f64::EPSILON);
        assert_eq!(m.row_distance, 0);
    }

    #[test]
    fn post_image_decay() {
        let m = calculate_match(60, &anchor(42, 58)).unwrap();
        assert_eq!(m.kind, SpatialMatchKind::PostImage);
        assert!((m.confidence - 0.21).abs() < f64::EPSILON);
    }

    #[test]
    fn top_offset_boosts_close_matches() {
        let mut a = anchor(42, 58);
        a.row_offs_top = 150_000;
        let m = calculate_match(40, &a).unwrap();
        assert!((m.confidence - 0.85).abs() < f64::EPSILON);

        // distance above 5 gets no boost
        let m = calculate_match(36, &a).unwrap();
        assert!((m.confidence - 0.55).abs() < f64::EPSILON);
    }

    #[test]
    fn image_assigned_to_best_issue() {
        // issues at rows 21, 40, 60; image spans 42-58
        let mut issues = vec![issue_at(1, 21), issue_at(2, 40), issue_at(3, 60)];
        let report = assign_images(&mut issues, vec![image("img002", anchor(42, 58))]);

        assert_eq!(report.assigned, 1);
        assert!(report.dropped.is_empty());
        assert_eq!(issues[1].images.len(), 1);
        assert!(issues[0].images.is_empty());
        assert!(issues[2].images.is_empty());

        let matched = issues[1].images[0].spatial_match.as_ref().unwrap();
        assert_eq!(matched.kind, SpatialMatchKind::Primary);
        assert!(matched.confidence >= 0.8);
        assert_eq!(issues[1].image_mapping_status.total, 1);
    }

    #[test]
    fn image_with_no_candidates_is_dropped() {
        let mut issues = vec![issue_at(1, 200)];
        let report = assign_images(&mut issues, vec![image("img002", anchor(42, 58))]);
        assert_eq!(report.assigned, 0);
        assert_eq!(report.dropped, vec!["img002".to_string()]);
        assert!(issues[0].images.is_empty());
    }

    #[test]
    fn only_candidate_wins_even_at_low_confidence() {
        // post_image is the weakest class but the only candidate still gets it
        let mut issues = vec![issue_at(1, 60)];
        let report = assign_images(&mut issues, vec![image("img002", anchor(42, 58))]);
        assert_eq!(report.assigned, 1);
        assert_eq!(
            issues[0].images[0].spatial_match.as_ref().unwrap().kind,
            SpatialMatchKind::PostImage
        );
    }
}
