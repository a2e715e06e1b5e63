//! Case extractor: spreadsheet -> Case + Issues + anchored images.
//!
//! The sheets follow a fixed template: metadata at fixed cells in rows 1-19,
//! a data table whose header row drifts between files, and pictures anchored
//! near their issue rows. Cell data comes from calamine; drawing anchors and
//! media bytes come from the archive directly (see `drawing`).

pub mod drawing;
pub mod mapper;

use calamine::{Data, Range, Reader, open_workbook_auto};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::{
    Case, CaseMetadata, ImageRef, Issue, MappingStatusCounts, MappingValidation, ValidationSummary,
    VlAnalysis,
};
use crate::utils::{ApiError, ApiResult};

/// Tokens expected in the data table header row
const KEY_HEADERS: [&str; 4] = ["NO", "問題点", "原因，对策", "型试"];

/// 0-based fallback header index when discovery fails
const DEFAULT_HEADER_ROW: u32 = 19;

pub struct CaseExtractor {
    output_dir: PathBuf,
    images_dir: PathBuf,
}

impl CaseExtractor {
    pub fn new(output_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let output_dir = output_dir.into();
        let images_dir = output_dir.join("images");
        std::fs::create_dir_all(&images_dir)?;
        Ok(Self { output_dir, images_dir })
    }

    /// Extract a complete case: metadata, issues, images mapped via anchors.
    pub fn extract_case(&self, spreadsheet: &Path) -> ApiResult<Case> {
        let file_name = spreadsheet.display().to_string();
        if !spreadsheet.exists() {
            return Err(ApiError::SpreadsheetNotFound(file_name));
        }

        tracing::info!("Processing {}", file_name);

        let mut workbook = open_workbook_auto(spreadsheet)
            .map_err(|e| ApiError::extraction_failed(&file_name, e.to_string()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| ApiError::extraction_failed(&file_name, "workbook has no sheets"))?
            .map_err(|e| ApiError::extraction_failed(&file_name, e.to_string()))?;

        let metadata = extract_metadata(&range, spreadsheet);
        let (header_row, header_detected) = match find_data_table_header(&range) {
            Some(row) => (row, true),
            None => {
                tracing::warn!(
                    "Could not auto-detect data table header, using default row {}",
                    DEFAULT_HEADER_ROW
                );
                (DEFAULT_HEADER_ROW, false)
            }
        };
        tracing::debug!("Data table header at row {} (0-based)", header_row);

        let mut issues = build_issues(&range, header_row);
        if issues.is_empty() {
            return Err(if header_detected {
                ApiError::EmptySheet(file_name)
            } else {
                ApiError::MissingDataHeader(file_name)
            });
        }
        tracing::info!("Found {} troubleshooting issues", issues.len());

        let stem = spreadsheet
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("case")
            .to_string();
        let images = self.extract_images(spreadsheet, &stem)?;
        tracing::info!("Extracted {} images", images.len());

        let report = mapper::assign_images(&mut issues, images);
        if report.assigned == 0 && !report.dropped.is_empty() {
            tracing::warn!(
                "No image-issue matches found for {}; continuing with zero images",
                file_name
            );
        }

        let case_id = generate_case_id(&metadata);
        let total_images = issues.iter().map(|i| i.images.len()).sum();
        let total_issues = issues.len();

        let case = Case {
            case_id,
            metadata,
            issues,
            total_issues,
            source_file: file_name,
            vlm_processed: false,
            vlm_summary: None,
            vlm_confidence: 0.0,
            tags: Vec::new(),
            key_insights: Vec::new(),
            validation: ValidationSummary { total_images, ..ValidationSummary::default() },
        };

        self.save_case_json(&case)?;

        Ok(case)
    }

    /// Persist the extracted case as pretty JSON for operator inspection
    pub fn save_case_json(&self, case: &Case) -> ApiResult<()> {
        let json_path = self.output_dir.join(format!("{}.json", case.case_id));
        let content = serde_json::to_string_pretty(case)?;
        std::fs::write(&json_path, content)
            .map_err(|e| ApiError::internal_error(format!("failed to write case JSON: {}", e)))?;
        tracing::info!("Saved case to {}", json_path.display());
        Ok(())
    }

    /// Extract embedded pictures, skipping the first (header logo), convert to
    /// RGB JPEG and save under the per-case images directory.
    fn extract_images(&self, spreadsheet: &Path, stem: &str) -> ApiResult<Vec<ImageRef>> {
        let drawings = drawing::read_drawing_images(spreadsheet)?;

        let mut images = Vec::new();
        for (idx, drawn) in drawings.into_iter().enumerate() {
            let ordinal = idx + 1;
            if ordinal == 1 {
                continue;
            }

            let image_id = format!("{}_img{:03}", stem, ordinal);
            let image_path = self.images_dir.join(format!("{}.jpg", image_id));

            match save_as_jpeg(&drawn.data, &image_path) {
                Ok(()) => images.push(ImageRef {
                    image_id,
                    file_path: image_path.display().to_string(),
                    anchor: drawn.anchor,
                    spatial_match: None,
                    mapping_validation: MappingValidation::default(),
                    vl: VlAnalysis::default(),
                }),
                Err(e) => {
                    tracing::warn!("Failed to extract image {}: {}", ordinal, e);
                }
            }
        }

        Ok(images)
    }
}

fn save_as_jpeg(data: &[u8], path: &Path) -> anyhow::Result<()> {
    let decoded = image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .decode()?;
    let rgb = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut out = std::fs::File::create(path)?;
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90);
    rgb.write_with_encoder(encoder)?;
    Ok(())
}

// ============================================================================
// Metadata
// ============================================================================

/// Fixed metadata cells, (row, col) 0-based: F4, F6, F8, G13, I13, K13, G14, G19
fn extract_metadata(range: &Range<Data>, spreadsheet: &Path) -> CaseMetadata {
    CaseMetadata {
        mold_type: cell_text(range, 3, 5),
        part_number: cell_text(range, 5, 5),
        internal_number: cell_text(range, 7, 5),
        material_t0: cell_text(range, 12, 6),
        material_t1: cell_text(range, 12, 8),
        material_t2: cell_text(range, 12, 10),
        color: cell_text(range, 13, 6),
        molding_machine: cell_text(range, 18, 6),
        source_filename: spreadsheet
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string(),
    }
}

fn cell_text(range: &Range<Data>, row: u32, col: u32) -> Option<String> {
    match range.get_value((row, col)) {
        None | Some(Data::Empty) => None,
        Some(value) => {
            let text = value.to_string().trim().to_string();
            if text.is_empty() { None } else { Some(text) }
        }
    }
}

// ============================================================================
// Data table
// ============================================================================

/// Scan 1-based rows 15..30 for a row whose first 14 columns contain at least
/// 3 of the canonical header tokens; returns the pandas-style 0-based index.
fn find_data_table_header(range: &Range<Data>) -> Option<u32> {
    for row in 14..29u32 {
        let mut values = Vec::new();
        for col in 0..14u32 {
            if let Some(text) = cell_text(range, row, col) {
                values.push(text);
            }
        }

        let matches = KEY_HEADERS
            .iter()
            .filter(|header| values.iter().any(|v| v.contains(**header)))
            .count();

        if matches >= 3 {
            return Some(row);
        }
    }
    None
}

/// Column indexes resolved from the header row by token containment
struct ColumnMap {
    no: Option<u32>,
    trial: Option<u32>,
    category: Option<u32>,
    problem: Option<u32>,
    solution: Option<u32>,
    result_t1: Option<u32>,
    result_t2: Option<u32>,
    cause: Option<u32>,
}

fn resolve_columns(range: &Range<Data>, header_row: u32) -> ColumnMap {
    let find = |token: &str| -> Option<u32> {
        (0..30u32).find(|col| {
            cell_text(range, header_row, *col)
                .map(|text| text.contains(token))
                .unwrap_or(false)
        })
    };

    ColumnMap {
        no: find("NO"),
        trial: find("型试"),
        category: find("项目"),
        problem: find("問題点"),
        solution: find("原因，对策"),
        result_t1: find("修正結果T1"),
        result_t2: find("修正結果T2"),
        cause: find("原因分类"),
    }
}

fn build_issues(range: &Range<Data>, header_row: u32) -> Vec<Issue> {
    let columns = resolve_columns(range, header_row);
    let last_row = range.end().map(|(row, _)| row).unwrap_or(0);

    let mut issues = Vec::new();
    for row in (header_row + 1)..=last_row {
        let no_text = columns.no.and_then(|col| cell_text(range, row, col));

        // duplicate header rows sometimes appear inside the data
        if no_text.as_deref() == Some("NO") {
            continue;
        }

        let Some(issue_number) = no_text.as_deref().and_then(parse_issue_number) else {
            continue;
        };

        let get = |col: Option<u32>| col.and_then(|c| cell_text(range, row, c));

        let issue = Issue {
            issue_number,
            row_id: format!("r{}", issues.len() + 1),
            excel_row: row + 1,
            trial_version: get(columns.trial),
            category: get(columns.category),
            problem: get(columns.problem).unwrap_or_default(),
            solution: get(columns.solution).unwrap_or_default(),
            result_t1: get(columns.result_t1),
            result_t2: get(columns.result_t2),
            cause_classification: get(columns.cause),
            images: Vec::new(),
            image_mapping_status: MappingStatusCounts::default(),
        };

        if issue.problem.is_empty() && issue.solution.is_empty() {
            continue;
        }

        issues.push(issue);
    }

    issues
}

fn parse_issue_number(text: &str) -> Option<i32> {
    if let Ok(n) = text.parse::<i32>() {
        return (n >= 1).then_some(n);
    }
    // numeric cells render as floats ("3" vs "3.0" depending on source)
    text.parse::<f64>().ok().and_then(|f| {
        let n = f as i32;
        (n >= 1 && (f - n as f64).abs() < f64::EPSILON).then_some(n)
    })
}

fn generate_case_id(metadata: &CaseMetadata) -> String {
    let part = metadata.part_number.as_deref().unwrap_or("UNKNOWN");
    let internal = metadata
        .internal_number
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string()[..8].to_string());
    format!("TS-{}-{}", part, internal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_with(cells: &[(u32, u32, &str)]) -> Range<Data> {
        let max_row = cells.iter().map(|(r, _, _)| *r).max().unwrap_or(0);
        let max_col = cells.iter().map(|(_, c, _)| *c).max().unwrap_or(0);
        let mut range = Range::new((0, 0), (max_row, max_col));
        for (row, col, value) in cells {
            range.set_value((*row, *col), Data::String(value.to_string()));
        }
        range
    }

    #[test]
    fn header_found_with_three_tokens() {
        let range = range_with(&[
            (20, 0, "NO"),
            (20, 2, "問題点"),
            (20, 4, "原因，对策"),
            (21, 0, "1"),
            (21, 2, "披锋"),
        ]);
        assert_eq!(find_data_table_header(&range), Some(20));
    }

    #[test]
    fn header_not_found_with_two_tokens() {
        let range = range_with(&[(20, 0, "NO"), (20, 2, "問題点")]);
        assert_eq!(find_data_table_header(&range), None);
    }

    #[test]
    fn issues_parsed_with_row_ids_and_excel_rows() {
        let range = range_with(&[
            (19, 0, "NO"),
            (19, 1, "型试"),
            (19, 2, "项目"),
            (19, 3, "問題点"),
            (19, 4, "原因，对策"),
            (19, 5, "修正結果T1"),
            (19, 6, "修正結果T2"),
            (20, 0, "1"),
            (20, 1, "T1"),
            (20, 3, "产品披锋"),
            (20, 4, "加大锁模力"),
            (20, 5, "OK"),
            (22, 0, "2"),
            (22, 3, "模具表面污染"),
            (22, 4, "清洗模面"),
            (22, 6, "NG"),
        ]);

        let issues = build_issues(&range, 19);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].row_id, "r1");
        assert_eq!(issues[0].excel_row, 21);
        assert_eq!(issues[0].result_t1.as_deref(), Some("OK"));
        assert_eq!(issues[1].row_id, "r2");
        assert_eq!(issues[1].excel_row, 23);
        assert_eq!(issues[1].result_t2.as_deref(), Some("NG"));
    }

    #[test]
    fn duplicate_header_and_non_numeric_rows_skipped() {
        let range = range_with(&[
            (19, 0, "NO"),
            (19, 3, "問題点"),
            (19, 4, "原因，对策"),
            (20, 0, "NO"),
            (20, 3, "問題点"),
            (21, 0, "备注"),
            (21, 3, "不是问题行"),
            (22, 0, "1"),
            (22, 3, "披锋"),
        ]);
        let issues = build_issues(&range, 19);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_number, 1);
    }

    #[test]
    fn case_id_falls_back_when_internal_missing() {
        let with_both = CaseMetadata {
            part_number: Some("1947688".into()),
            internal_number: Some("ED736A0501".into()),
            ..CaseMetadata::default()
        };
        assert_eq!(generate_case_id(&with_both), "TS-1947688-ED736A0501");

        let missing = CaseMetadata { part_number: None, internal_number: None, ..CaseMetadata::default() };
        let case_id = generate_case_id(&missing);
        assert!(case_id.starts_with("TS-UNKNOWN-"));
        assert_eq!(case_id.len(), "TS-UNKNOWN-".len() + 8);
    }

    #[test]
    fn numeric_cells_parse_as_issue_numbers() {
        assert_eq!(parse_issue_number("3"), Some(3));
        assert_eq!(parse_issue_number("3.0"), Some(3));
        assert_eq!(parse_issue_number("0"), None);
        assert_eq!(parse_issue_number("NO"), None);
    }

    #[test]
    fn case_json_round_trips_through_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = CaseExtractor::new(dir.path()).unwrap();

        let case = Case {
            case_id: "TS-1947688-ED736A0501".into(),
            metadata: CaseMetadata {
                part_number: Some("1947688".into()),
                internal_number: Some("ED736A0501".into()),
                ..CaseMetadata::default()
            },
            issues: Vec::new(),
            total_issues: 0,
            source_file: "case.xlsx".into(),
            vlm_processed: false,
            vlm_summary: None,
            vlm_confidence: 0.0,
            tags: Vec::new(),
            key_insights: Vec::new(),
            validation: ValidationSummary::default(),
        };
        extractor.save_case_json(&case).unwrap();

        let json_path = dir.path().join("TS-1947688-ED736A0501.json");
        let loaded: Case =
            serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(loaded.case_id, case.case_id);
        assert_eq!(loaded.metadata.part_number.as_deref(), Some("1947688"));

        // the images directory is created alongside the JSON
        assert!(dir.path().join("images").is_dir());
    }
}
