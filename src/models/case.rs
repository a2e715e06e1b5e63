//! Case / Issue / ImageRef domain model
//!
//! One Case per source spreadsheet; one Issue per data-table row; one
//! ImageRef per embedded picture. Anchors keep both the raw EMU offsets and
//! the derived geometry so the mapper and the validation pipeline can reason
//! about placement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// EMU units per inch in spreadsheet drawing coordinates
pub const EMU_PER_INCH: i64 = 914_400;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum AnchorType {
    OneCell,
    TwoCell,
    Unknown,
}

impl Default for AnchorType {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Spatial match class between an issue row and an image anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SpatialMatchKind {
    Primary,
    Secondary,
    Tertiary,
    Inline,
    Overlap,
    PostImage,
}

impl SpatialMatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Tertiary => "tertiary",
            Self::Inline => "inline",
            Self::Overlap => "overlap",
            Self::PostImage => "post_image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Pending,
    Validated,
    ReviewRequired,
}

impl Default for MappingStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    AnchorBased,
    VlmConfirmed,
    VlmCorrected,
    Manual,
}

impl Default for MappingMethod {
    fn default() -> Self {
        Self::AnchorBased
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    NotStarted,
    Completed,
    Failed,
}

impl Default for ValidationStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Defect severity, ordered high > medium > low for rollups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Max severity across a set, by the high > medium > low order
    pub fn max_of(severities: impl IntoIterator<Item = Severity>) -> Option<Severity> {
        severities.into_iter().max_by_key(|s| s.rank())
    }
}

// ============================================================================
// Anchors and matching
// ============================================================================

/// Cell region an embedded picture is attached to.
///
/// Offsets are in EMU (1/914400 inch). `row_end`/`col_end` are exact for
/// two-cell anchors and approximated from the extent for one-cell anchors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Anchor {
    pub row_start: u32,
    pub row_end: u32,
    pub col_start: u32,
    pub col_end: u32,
    pub row_offs_top: i64,
    pub row_offs_bottom: i64,
    pub col_offs_left: i64,
    pub col_offs_right: i64,
    pub height_emu: i64,
    pub width_emu: i64,
    pub anchor_type: AnchorType,
    /// Rendered page number, assigned by the page renderer
    #[serde(default)]
    pub page: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SpatialMatch {
    pub kind: SpatialMatchKind,
    pub confidence: f64,
    pub row_distance: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct MappingValidation {
    pub status: MappingStatus,
    pub method: MappingMethod,
    pub confidence: f64,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
}

// ============================================================================
// VLM enrichment
// ============================================================================

/// Per-image vision-language analysis. All fields empty until enrichment runs;
/// a failed image keeps the empty analysis rather than aborting the case.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VlAnalysis {
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
    pub severity: Option<Severity>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    #[serde(default)]
    pub vlm_confidence: f64,
}

// ============================================================================
// Core entities
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ImageRef {
    pub image_id: String,
    pub file_path: String,
    pub anchor: Anchor,
    #[serde(default)]
    pub spatial_match: Option<SpatialMatch>,
    #[serde(default)]
    pub mapping_validation: MappingValidation,
    #[serde(default)]
    pub vl: VlAnalysis,
}

/// Header metadata lifted from fixed cells in rows 1-19.
/// Missing or blank cells are None, never "".
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CaseMetadata {
    pub part_number: Option<String>,
    pub internal_number: Option<String>,
    pub mold_type: Option<String>,
    pub material_t0: Option<String>,
    pub material_t1: Option<String>,
    pub material_t2: Option<String>,
    pub color: Option<String>,
    pub molding_machine: Option<String>,
    pub source_filename: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct MappingStatusCounts {
    pub total: usize,
    pub validated: usize,
    pub pending_review: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Issue {
    pub issue_number: i32,
    /// Sequential row id within the case: r1, r2, ...
    pub row_id: String,
    /// Absolute 1-based spreadsheet row the issue was read from
    pub excel_row: u32,
    #[serde(default)]
    pub trial_version: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub problem: String,
    pub solution: String,
    #[serde(default)]
    pub result_t1: Option<String>,
    #[serde(default)]
    pub result_t2: Option<String>,
    #[serde(default)]
    pub cause_classification: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub image_mapping_status: MappingStatusCounts,
}

impl Issue {
    /// Globally unique issue id; the excel_row suffix disambiguates rows that
    /// repeat an issue number.
    pub fn issue_id(&self, case_id: &str) -> String {
        format!("{}-{}-{}", case_id, self.issue_number, self.excel_row)
    }

    /// Flattened non-empty defect types across attached images
    pub fn defect_types(&self) -> Vec<String> {
        self.images
            .iter()
            .filter_map(|img| img.vl.defect_type.clone())
            .filter(|d| !d.is_empty())
            .collect()
    }

    /// Max severity across images, by the high > medium > low order
    pub fn max_severity(&self) -> Option<Severity> {
        Severity::max_of(self.images.iter().filter_map(|img| img.vl.severity))
    }

    /// Max VLM confidence across images; 0.0 when there are none
    pub fn max_vlm_confidence(&self) -> f64 {
        self.images
            .iter()
            .map(|img| img.vl.vlm_confidence)
            .fold(0.0, f64::max)
    }

    /// Unique tags in insertion order, capped at 10
    pub fn aggregated_tags(&self) -> Vec<String> {
        unique_capped(self.images.iter().flat_map(|img| img.vl.tags.iter()), 10)
    }

    /// Unique key insights in insertion order, capped at 5
    pub fn aggregated_insights(&self) -> Vec<String> {
        unique_capped(self.images.iter().flat_map(|img| img.vl.key_insights.iter()), 5)
    }

    /// Unique suggested actions in insertion order, capped at 5
    pub fn aggregated_actions(&self) -> Vec<String> {
        unique_capped(self.images.iter().flat_map(|img| img.vl.suggested_actions.iter()), 5)
    }

    pub fn refresh_mapping_status(&mut self) {
        let validated = self
            .images
            .iter()
            .filter(|img| img.mapping_validation.status == MappingStatus::Validated)
            .count();
        let pending_review = self
            .images
            .iter()
            .filter(|img| img.mapping_validation.status == MappingStatus::ReviewRequired)
            .count();
        self.image_mapping_status =
            MappingStatusCounts { total: self.images.len(), validated, pending_review };
    }
}

fn unique_capped<'a>(items: impl Iterator<Item = &'a String>, cap: usize) -> Vec<String> {
    let mut seen = Vec::new();
    for item in items {
        if item.is_empty() || seen.contains(item) {
            continue;
        }
        seen.push(item.clone());
        if seen.len() >= cap {
            break;
        }
    }
    seen
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ValidationSummary {
    pub status: ValidationStatus,
    #[serde(default)]
    pub validated_at: Option<DateTime<Utc>>,
    pub pages_processed: usize,
    pub total_images: usize,
    pub auto_corrected: usize,
    pub pending_review: usize,
    pub average_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Case {
    pub case_id: String,
    pub metadata: CaseMetadata,
    pub issues: Vec<Issue>,
    pub total_issues: usize,
    pub source_file: String,
    #[serde(default)]
    pub vlm_processed: bool,
    #[serde(default)]
    pub vlm_summary: Option<String>,
    #[serde(default)]
    pub vlm_confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub validation: ValidationSummary,
}

impl Case {
    pub fn image_count(&self) -> usize {
        self.issues.iter().map(|i| i.images.len()).sum()
    }

    pub fn find_issue_by_row_id(&self, row_id: &str) -> Option<&Issue> {
        self.issues.iter().find(|i| i.row_id == row_id)
    }
}

// ============================================================================
// Knowledge and audit records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Synonym {
    pub canonical_term: String,
    pub synonym: String,
    pub term_type: String,
    pub confidence: f64,
    pub usage_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Learning {
    pub title: String,
    pub learning: String,
    pub learning_type: String,
    pub tables_affected: Vec<String>,
    pub usage_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ValidatedQuery {
    pub name: String,
    pub question: String,
    pub sql_query: String,
    pub tables_used: Vec<String>,
    pub summary: Option<String>,
}

/// Per-query identity; None is only acceptable when strict mode is off
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub org_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(severity: Option<Severity>, tags: &[&str], confidence: f64) -> ImageRef {
        ImageRef {
            image_id: "img".into(),
            file_path: "/tmp/img.jpg".into(),
            anchor: Anchor::default(),
            spatial_match: None,
            mapping_validation: MappingValidation::default(),
            vl: VlAnalysis {
                severity,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                vlm_confidence: confidence,
                ..VlAnalysis::default()
            },
        }
    }

    fn issue_with(images: Vec<ImageRef>) -> Issue {
        Issue {
            issue_number: 1,
            row_id: "r1".into(),
            excel_row: 21,
            trial_version: None,
            category: None,
            problem: "披锋".into(),
            solution: "调整锁模力".into(),
            result_t1: None,
            result_t2: None,
            cause_classification: None,
            images,
            image_mapping_status: MappingStatusCounts::default(),
        }
    }

    #[test]
    fn issue_id_includes_excel_row_suffix() {
        let issue = issue_with(vec![]);
        assert_eq!(issue.issue_id("TS-1947688-ED736A0501"), "TS-1947688-ED736A0501-1-21");
    }

    #[test]
    fn severity_rollup_is_max_by_order() {
        let issue = issue_with(vec![
            image_with(Some(Severity::Low), &[], 0.2),
            image_with(Some(Severity::High), &[], 0.9),
            image_with(Some(Severity::Medium), &[], 0.5),
        ]);
        assert_eq!(issue.max_severity(), Some(Severity::High));
        assert_eq!(issue.max_vlm_confidence(), 0.9);
    }

    #[test]
    fn severity_rollup_empty_is_none() {
        let issue = issue_with(vec![]);
        assert_eq!(issue.max_severity(), None);
        assert_eq!(issue.max_vlm_confidence(), 0.0);
    }

    #[test]
    fn tags_are_unique_in_insertion_order_and_capped() {
        let many: Vec<String> = (0..15).map(|i| format!("tag{}", i)).collect();
        let many_refs: Vec<&str> = many.iter().map(|s| s.as_str()).collect();
        let issue = issue_with(vec![
            image_with(None, &["飞边", "锁模"], 0.0),
            image_with(None, &["飞边"], 0.0),
            image_with(None, &many_refs, 0.0),
        ]);
        let tags = issue.aggregated_tags();
        assert_eq!(tags.len(), 10);
        assert_eq!(tags[0], "飞边");
        assert_eq!(tags[1], "锁模");
        assert_eq!(tags.iter().filter(|t| *t == "飞边").count(), 1);
    }
}
