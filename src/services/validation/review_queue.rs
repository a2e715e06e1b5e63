//! Review queue: flagged corrections persisted for human follow-up.

use std::path::PathBuf;

use crate::utils::{ApiError, ApiResult};

use super::corrections::{CorrectionStatus, MappingCorrection};

pub struct ReviewQueue {
    queue_dir: PathBuf,
}

impl ReviewQueue {
    pub fn new(queue_dir: impl Into<PathBuf>) -> Self {
        Self { queue_dir: queue_dir.into() }
    }

    /// Write the flagged corrections of a case as one JSON file.
    pub fn save_case_reviews(
        &self,
        case_id: &str,
        corrections: &[MappingCorrection],
    ) -> ApiResult<PathBuf> {
        let flagged: Vec<&MappingCorrection> = corrections
            .iter()
            .filter(|c| c.status == CorrectionStatus::Flagged)
            .collect();

        std::fs::create_dir_all(&self.queue_dir)
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        let path = self.queue_dir.join(format!("{}.json", case_id));
        let content = serde_json::to_string_pretty(&flagged)?;
        std::fs::write(&path, content).map_err(|e| ApiError::internal_error(e.to_string()))?;

        tracing::info!("Queued {} mappings of {} for review", flagged.len(), case_id);
        Ok(path)
    }
}
