//! Page renderer: spreadsheet -> PDF -> per-page PNG, plus page row ranges.
//!
//! LibreOffice headless does the PDF conversion and pdftoppm (poppler) the
//! rasterization. Page row ranges come from the sheet's explicit row breaks,
//! falling back to a fixed rows-per-page split when none exist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::models::Case;
use crate::services::extractor::drawing;
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Default)]
pub struct PageContext {
    /// row_ids of issues on this page
    pub rows: Vec<String>,
    /// image_ids anchored on this page
    pub images: Vec<String>,
}

#[derive(Debug)]
pub struct PageRenderResult {
    pub pdf_path: PathBuf,
    pub page_images: Vec<PathBuf>,
    pub page_ranges: Vec<(u32, u32)>,
    /// page number (1-based) -> context
    pub page_context: HashMap<u32, PageContext>,
}

pub struct PageRenderer {
    output_dir: PathBuf,
    dpi: u32,
    rows_per_page_fallback: u32,
    libreoffice_path: Option<String>,
}

impl PageRenderer {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        dpi: u32,
        rows_per_page_fallback: u32,
        libreoffice_path: Option<String>,
    ) -> Self {
        Self { output_dir: output_dir.into(), dpi, rows_per_page_fallback, libreoffice_path }
    }

    /// Render the spreadsheet and assign `anchor.page` on every image.
    pub async fn render(&self, spreadsheet: &Path, case: &mut Case) -> ApiResult<PageRenderResult> {
        let pdf_path = self.convert_to_pdf(spreadsheet).await?;
        let page_images = self.rasterize(&pdf_path).await?;

        let max_row = case
            .issues
            .iter()
            .flat_map(|issue| {
                std::iter::once(issue.excel_row)
                    .chain(issue.images.iter().map(|img| img.anchor.row_end))
            })
            .max()
            .unwrap_or(1);
        let page_ranges = self.page_ranges(spreadsheet, max_row)?;
        let page_context = build_page_context(case, &page_ranges);

        Ok(PageRenderResult { pdf_path, page_images, page_ranges, page_context })
    }

    async fn convert_to_pdf(&self, spreadsheet: &Path) -> ApiResult<PathBuf> {
        let pdf_dir = self.output_dir.join("pdf");
        std::fs::create_dir_all(&pdf_dir)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;

        let libreoffice = self.resolve_libreoffice().ok_or_else(|| {
            ApiError::dependency(
                "libreoffice",
                "executable not found; install LibreOffice or set ingestion.libreoffice_path",
            )
        })?;

        tracing::info!("Rendering spreadsheet to PDF via LibreOffice");
        let output = Command::new(&libreoffice)
            .arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(&pdf_dir)
            .arg(spreadsheet)
            .output()
            .await
            .map_err(|e| ApiError::dependency("libreoffice", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ApiError::dependency(
                "libreoffice",
                format!("conversion failed: {}", stderr),
            ));
        }

        let stem = spreadsheet
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("case");
        let pdf_path = pdf_dir.join(format!("{}.pdf", stem));
        if !pdf_path.exists() {
            return Err(ApiError::dependency(
                "libreoffice",
                format!("PDF not found after conversion: {}", pdf_path.display()),
            ));
        }
        Ok(pdf_path)
    }

    async fn rasterize(&self, pdf_path: &Path) -> ApiResult<Vec<PathBuf>> {
        let pages_dir = self.output_dir.join("pages");
        std::fs::create_dir_all(&pages_dir)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;

        tracing::info!("Rendering PDF pages to images at {} dpi", self.dpi);
        let output = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(pdf_path)
            .arg(pages_dir.join("page"))
            .output()
            .await
            .map_err(|e| ApiError::dependency("pdftoppm", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ApiError::dependency("pdftoppm", format!("rasterize failed: {}", stderr)));
        }

        let mut pages: Vec<PathBuf> = std::fs::read_dir(&pages_dir)
            .map_err(|e| ApiError::internal_error(e.to_string()))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("png"))
            .collect();
        pages.sort();

        if pages.is_empty() {
            return Err(ApiError::dependency("pdftoppm", "no page images produced"));
        }
        Ok(pages)
    }

    fn resolve_libreoffice(&self) -> Option<PathBuf> {
        if let Some(configured) = &self.libreoffice_path {
            let path = PathBuf::from(configured);
            if path.exists() {
                return Some(path);
            }
            if let Some(found) = find_on_path(configured) {
                return Some(found);
            }
        }
        ["libreoffice", "soffice"]
            .iter()
            .find_map(|candidate| find_on_path(candidate))
    }

    fn page_ranges(&self, spreadsheet: &Path, max_row: u32) -> ApiResult<Vec<(u32, u32)>> {
        let breaks = drawing::read_row_breaks(spreadsheet)?;
        Ok(compute_page_ranges(&breaks, max_row, self.rows_per_page_fallback))
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Row ranges per page: explicit breaks split before their row; otherwise a
/// fixed rows-per-page fallback.
pub fn compute_page_ranges(breaks: &[u32], max_row: u32, rows_per_page: u32) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();

    if breaks.is_empty() {
        let mut start = 1u32;
        while start <= max_row {
            let end = (start + rows_per_page - 1).min(max_row);
            ranges.push((start, end));
            start = end + 1;
        }
        return ranges;
    }

    let mut start = 1u32;
    for brk in breaks {
        let end = brk.saturating_sub(1).max(start);
        ranges.push((start, end));
        start = *brk;
    }
    ranges.push((start, max_row.max(start)));
    ranges
}

pub fn page_for_row(page_ranges: &[(u32, u32)], row: u32) -> Option<u32> {
    page_ranges
        .iter()
        .position(|(start, end)| *start <= row && row <= *end)
        .map(|idx| idx as u32 + 1)
}

fn build_page_context(case: &mut Case, page_ranges: &[(u32, u32)]) -> HashMap<u32, PageContext> {
    let mut context: HashMap<u32, PageContext> = HashMap::new();
    for page in 1..=page_ranges.len() as u32 {
        context.insert(page, PageContext::default());
    }

    for issue in &mut case.issues {
        if let Some(page) = page_for_row(page_ranges, issue.excel_row)
            && let Some(entry) = context.get_mut(&page)
        {
            entry.rows.push(issue.row_id.clone());
        }

        for image in &mut issue.images {
            if let Some(page) = page_for_row(page_ranges, image.anchor.row_start) {
                image.anchor.page = Some(page);
                if let Some(entry) = context.get_mut(&page) {
                    entry.images.push(image.image_id.clone());
                }
            }
        }
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_breaks_split_before_their_row() {
        let ranges = compute_page_ranges(&[46, 92], 120, 50);
        assert_eq!(ranges, vec![(1, 45), (46, 91), (92, 120)]);
    }

    #[test]
    fn fallback_splits_fixed_rows_per_page() {
        let ranges = compute_page_ranges(&[], 120, 50);
        assert_eq!(ranges, vec![(1, 50), (51, 100), (101, 120)]);
    }

    #[test]
    fn page_lookup_covers_boundaries() {
        let ranges = compute_page_ranges(&[46], 90, 50);
        assert_eq!(page_for_row(&ranges, 1), Some(1));
        assert_eq!(page_for_row(&ranges, 45), Some(1));
        assert_eq!(page_for_row(&ranges, 46), Some(2));
        assert_eq!(page_for_row(&ranges, 90), Some(2));
        assert_eq!(page_for_row(&ranges, 91), None);
    }
}
