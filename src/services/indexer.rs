//! Dual indexer: one relational row set plus two vector collections per case.
//!
//! Write order is fixed: delete prior state, upsert relational rows, then
//! compute embeddings and upsert vectors. A failure after the relational
//! write surfaces as a partial-write error; reruns are safe because the
//! delete step re-cleans both sides.

use sqlx::PgPool;
use std::sync::Arc;

use crate::models::{Case, Issue};
use crate::services::embedding_client::Embeddings;
use crate::services::vector_store::VectorStore;
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub case_points: usize,
    pub issue_points: usize,
}

pub struct CaseIndexer {
    pool: PgPool,
    vector_store: Arc<VectorStore>,
    embeddings: Arc<dyn Embeddings>,
}

impl CaseIndexer {
    pub fn new(pool: PgPool, vector_store: Arc<VectorStore>, embeddings: Arc<dyn Embeddings>) -> Self {
        Self { pool, vector_store, embeddings }
    }

    pub async fn index_case(&self, case: &Case, force_reindex: bool) -> ApiResult<IndexStats> {
        let case_id = &case.case_id;
        tracing::info!("Indexing case {}", case_id);

        if force_reindex {
            tracing::info!("Removing existing entries for {}", case_id);
            self.delete_case(case_id).await?;
        } else if self.case_exists(case_id).await? {
            return Err(ApiError::CaseConflict(case_id.clone()));
        }

        // relational first; if this fails nothing else runs
        self.upsert_case_row(case).await?;
        let issue_rows = self.upsert_issue_rows(case).await?;
        tracing::debug!("Upserted {} issue rows", issue_rows);

        // vector side; a failure here leaves the relational write in place
        match self.index_vectors(case).await {
            Ok(stats) => {
                tracing::info!(
                    "Indexed {}: 1 case point + {} issue points",
                    case_id,
                    stats.issue_points
                );
                Ok(stats)
            }
            Err(e) => Err(ApiError::PartialWrite {
                case_id: case_id.clone(),
                wrote: "relational".to_string(),
                failed: "vector".to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub async fn delete_case(&self, case_id: &str) -> ApiResult<()> {
        self.vector_store.delete_case(case_id).await?;

        // issues cascade from the case row
        sqlx::query("DELETE FROM troubleshooting_cases WHERE case_id = $1")
            .bind(case_id)
            .execute(&self.pool)
            .await?;

        tracing::info!("Deleted case {}", case_id);
        Ok(())
    }

    async fn case_exists(&self, case_id: &str) -> ApiResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM troubleshooting_cases WHERE case_id = $1")
                .bind(case_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    // ========================================================================
    // Relational writes
    // ========================================================================

    async fn upsert_case_row(&self, case: &Case) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO troubleshooting_cases (
                case_id, part_number, internal_number, mold_type,
                material, color, total_issues, source_file,
                vlm_processed, vlm_summary, vlm_confidence,
                key_insights, tags, validation_status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (case_id) DO UPDATE SET
                part_number = EXCLUDED.part_number,
                internal_number = EXCLUDED.internal_number,
                mold_type = EXCLUDED.mold_type,
                material = EXCLUDED.material,
                color = EXCLUDED.color,
                total_issues = EXCLUDED.total_issues,
                source_file = EXCLUDED.source_file,
                vlm_processed = EXCLUDED.vlm_processed,
                vlm_summary = EXCLUDED.vlm_summary,
                vlm_confidence = EXCLUDED.vlm_confidence,
                key_insights = EXCLUDED.key_insights,
                tags = EXCLUDED.tags,
                validation_status = EXCLUDED.validation_status,
                updated_at = NOW()
            "#,
        )
        .bind(&case.case_id)
        .bind(&case.metadata.part_number)
        .bind(&case.metadata.internal_number)
        .bind(&case.metadata.mold_type)
        .bind(&case.metadata.material_t0)
        .bind(&case.metadata.color)
        .bind(case.total_issues as i64)
        .bind(&case.source_file)
        .bind(case.vlm_processed)
        .bind(&case.vlm_summary)
        .bind(case.vlm_confidence)
        .bind(&case.key_insights)
        .bind(&case.tags)
        .bind(case.validation.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_issue_rows(&self, case: &Case) -> ApiResult<usize> {
        for issue in &case.issues {
            sqlx::query(
                r#"
                INSERT INTO troubleshooting_issues (
                    issue_id, case_id, issue_number, excel_row,
                    trial_version, category, problem, solution,
                    result_t1, result_t2, cause_classification, defect_types,
                    vlm_processed, vlm_confidence, severity, tags,
                    key_insights, suggested_actions, has_images, image_count
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                          $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
                ON CONFLICT (issue_id) DO UPDATE SET
                    trial_version = EXCLUDED.trial_version,
                    category = EXCLUDED.category,
                    problem = EXCLUDED.problem,
                    solution = EXCLUDED.solution,
                    result_t1 = EXCLUDED.result_t1,
                    result_t2 = EXCLUDED.result_t2,
                    cause_classification = EXCLUDED.cause_classification,
                    defect_types = EXCLUDED.defect_types,
                    vlm_processed = EXCLUDED.vlm_processed,
                    vlm_confidence = EXCLUDED.vlm_confidence,
                    severity = EXCLUDED.severity,
                    tags = EXCLUDED.tags,
                    key_insights = EXCLUDED.key_insights,
                    suggested_actions = EXCLUDED.suggested_actions,
                    has_images = EXCLUDED.has_images,
                    image_count = EXCLUDED.image_count,
                    updated_at = NOW()
                "#,
            )
            .bind(issue.issue_id(&case.case_id))
            .bind(&case.case_id)
            .bind(issue.issue_number)
            .bind(issue.excel_row as i64)
            .bind(&issue.trial_version)
            .bind(&issue.category)
            .bind(&issue.problem)
            .bind(&issue.solution)
            .bind(&issue.result_t1)
            .bind(&issue.result_t2)
            .bind(&issue.cause_classification)
            .bind(issue.defect_types())
            .bind(case.vlm_processed)
            .bind(issue.max_vlm_confidence())
            .bind(issue.max_severity().map(|s| s.as_str()))
            .bind(issue.aggregated_tags())
            .bind(issue.aggregated_insights())
            .bind(issue.aggregated_actions())
            .bind(!issue.images.is_empty())
            .bind(issue.images.len() as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(case.issues.len())
    }

    // ========================================================================
    // Vector writes
    // ========================================================================

    async fn index_vectors(&self, case: &Case) -> ApiResult<IndexStats> {
        tracing::debug!("Generating case-level embedding");
        let summary_text = case_summary_text(case);
        let case_vector = self.embeddings.embed(&summary_text).await?;
        self.vector_store
            .upsert_point(
                &self.vector_store.case_collection,
                case_vector,
                case_payload(case, &summary_text),
            )
            .await?;

        tracing::debug!("Generating embeddings for {} issues", case.issues.len());
        let issue_texts: Vec<String> =
            case.issues.iter().map(issue_embedding_text).collect();
        let issue_vectors = self.embeddings.embed_batch(&issue_texts).await?;

        let entries: Vec<(Vec<f32>, serde_json::Value)> = case
            .issues
            .iter()
            .zip(issue_vectors)
            .zip(issue_texts.iter())
            .map(|((issue, vector), text)| (vector, issue_payload(case, issue, text)))
            .collect();
        let issue_points = entries.len();

        self.vector_store
            .upsert_points(&self.vector_store.issue_collection, entries)
            .await?;

        Ok(IndexStats { case_points: 1, issue_points })
    }
}

// ============================================================================
// Embedding texts
// ============================================================================

/// Case summary text feeding the case-level vector
pub fn case_summary_text(case: &Case) -> String {
    let mut parts = vec![format!(
        "零件号 {} 材料 {} {} 个问题",
        case.metadata.part_number.as_deref().unwrap_or(""),
        case.metadata.material_t0.as_deref().unwrap_or(""),
        case.total_issues
    )];

    for issue in case.issues.iter().take(3) {
        if !issue.problem.is_empty() {
            parts.push(issue.problem.clone());
        }
    }

    for insight in case.key_insights.iter().take(2) {
        parts.push(insight.clone());
    }

    parts.join(" ")
}

/// Issue embedding text: labeled concatenation of the textual, visual, and
/// structured fields; empty fields are skipped.
pub fn issue_embedding_text(issue: &Issue) -> String {
    let mut parts = Vec::new();

    if !issue.problem.is_empty() {
        parts.push(format!("问题: {}", issue.problem));
    }
    if !issue.solution.is_empty() {
        parts.push(format!("解决方案: {}", issue.solution));
    }

    for image in &issue.images {
        if let Some(description) = image.vl.description.as_deref().filter(|d| !d.is_empty()) {
            parts.push(format!("图像显示: {}", description));
        }
        if let Some(defect_type) = image.vl.defect_type.as_deref().filter(|d| !d.is_empty()) {
            parts.push(format!("缺陷类型: {}", defect_type));
        }
        if let Some(text) = image.vl.text_in_image.as_deref().filter(|t| !t.is_empty()) {
            parts.push(format!("图像文字: {}", text));
        }
    }

    if let Some(trial) = issue.trial_version.as_deref().filter(|t| !t.is_empty()) {
        parts.push(format!("试模阶段: {}", trial));
    }
    if let Some(result) = issue.result_t1.as_deref().filter(|r| !r.is_empty()) {
        parts.push(format!("T1结果: {}", result));
    }
    if let Some(result) = issue.result_t2.as_deref().filter(|r| !r.is_empty()) {
        parts.push(format!("T2结果: {}", result));
    }
    if let Some(category) = issue.category.as_deref().filter(|c| !c.is_empty()) {
        parts.push(format!("类别: {}", category));
    }

    parts.join(" ")
}

// ============================================================================
// Payloads
// ============================================================================

fn case_payload(case: &Case, summary_text: &str) -> serde_json::Value {
    serde_json::json!({
        "case_id": case.case_id,
        "part_number": case.metadata.part_number,
        "internal_number": case.metadata.internal_number,
        "mold_type": case.metadata.mold_type,
        "material": case.metadata.material_t0,
        "color": case.metadata.color,
        "total_issues": case.total_issues,
        "issue_ids": case.issues.iter().map(|i| i.issue_number).collect::<Vec<_>>(),
        "source_file": case.source_file,
        "text_summary": summary_text,
        "vlm_processed": case.vlm_processed,
        "vlm_summary": case.vlm_summary,
        "key_insights": case.key_insights,
        "tags": case.tags,
        "vlm_confidence": case.vlm_confidence,
    })
}

fn issue_payload(case: &Case, issue: &Issue, combined_text: &str) -> serde_json::Value {
    let vl_descriptions: Vec<String> = issue
        .images
        .iter()
        .filter_map(|img| img.vl.description.clone())
        .filter(|d| !d.is_empty())
        .collect();

    serde_json::json!({
        "issue_id": issue.issue_id(&case.case_id),
        "case_id": case.case_id,
        "part_number": case.metadata.part_number,
        "internal_number": case.metadata.internal_number,
        "issue_number": issue.issue_number,
        "trial_version": issue.trial_version,
        "category": issue.category,
        "problem": issue.problem,
        "solution": issue.solution,
        "result_t1": issue.result_t1,
        "result_t2": issue.result_t2,
        "cause_classification": issue.cause_classification,
        "has_images": !issue.images.is_empty(),
        "image_count": issue.images.len(),
        "defect_types": issue.defect_types(),
        "vl_descriptions": vl_descriptions,
        "combined_text": combined_text,
        "vlm_processed": case.vlm_processed,
        "vlm_confidence": issue.max_vlm_confidence(),
        "severity": issue.max_severity().map(|s| s.as_str()),
        "tags": issue.aggregated_tags(),
        "key_insights": issue.aggregated_insights(),
        "suggested_actions": issue.aggregated_actions(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Anchor, CaseMetadata, ImageRef, MappingStatusCounts, MappingValidation, Severity,
        ValidationSummary, VlAnalysis,
    };

    fn sample_case() -> Case {
        let image = ImageRef {
            image_id: "case_img002".into(),
            file_path: "/tmp/case_img002.jpg".into(),
            anchor: Anchor::default(),
            spatial_match: None,
            mapping_validation: MappingValidation::default(),
            vl: VlAnalysis {
                description: Some("分型面处可见飞边".into()),
                defect_type: Some("披锋".into()),
                text_in_image: Some("NG".into()),
                severity: Some(Severity::High),
                vlm_confidence: 0.92,
                ..VlAnalysis::default()
            },
        };

        let issues = vec![
            Issue {
                issue_number: 1,
                row_id: "r1".into(),
                excel_row: 21,
                trial_version: Some("T1".into()),
                category: Some("外观".into()),
                problem: "产品披锋".into(),
                solution: "加大锁模力".into(),
                result_t1: Some("OK".into()),
                result_t2: None,
                cause_classification: None,
                images: vec![image],
                image_mapping_status: MappingStatusCounts::default(),
            },
            Issue {
                issue_number: 2,
                row_id: "r2".into(),
                excel_row: 40,
                trial_version: None,
                category: None,
                problem: "模具表面污染".into(),
                solution: String::new(),
                result_t1: None,
                result_t2: None,
                cause_classification: None,
                images: Vec::new(),
                image_mapping_status: MappingStatusCounts::default(),
            },
        ];

        Case {
            case_id: "TS-1947688-ED736A0501".into(),
            metadata: CaseMetadata {
                part_number: Some("1947688".into()),
                internal_number: Some("ED736A0501".into()),
                material_t0: Some("HIPS".into()),
                ..CaseMetadata::default()
            },
            total_issues: issues.len(),
            issues,
            source_file: "case.xlsx".into(),
            vlm_processed: true,
            vlm_summary: None,
            vlm_confidence: 0.92,
            tags: Vec::new(),
            key_insights: vec!["锁模力不足导致披锋".into()],
            validation: ValidationSummary::default(),
        }
    }

    #[test]
    fn case_summary_includes_part_material_and_problems() {
        let case = sample_case();
        let summary = case_summary_text(&case);
        assert!(summary.starts_with("零件号 1947688 材料 HIPS 2 个问题"));
        assert!(summary.contains("产品披锋"));
        assert!(summary.contains("模具表面污染"));
        assert!(summary.contains("锁模力不足导致披锋"));
    }

    #[test]
    fn issue_text_labels_fields_and_skips_empty() {
        let case = sample_case();
        let text = issue_embedding_text(&case.issues[0]);
        assert!(text.contains("问题: 产品披锋"));
        assert!(text.contains("解决方案: 加大锁模力"));
        assert!(text.contains("图像显示: 分型面处可见飞边"));
        assert!(text.contains("缺陷类型: 披锋"));
        assert!(text.contains("图像文字: NG"));
        assert!(text.contains("试模阶段: T1"));
        assert!(text.contains("T1结果: OK"));
        assert!(!text.contains("T2结果"));

        let bare = issue_embedding_text(&case.issues[1]);
        assert_eq!(bare, "问题: 模具表面污染");
    }

    #[test]
    fn issue_payload_carries_aggregates() {
        let case = sample_case();
        let payload = issue_payload(&case, &case.issues[0], "combined");
        assert_eq!(payload["issue_id"], "TS-1947688-ED736A0501-1-21");
        assert_eq!(payload["defect_types"], serde_json::json!(["披锋"]));
        assert_eq!(payload["severity"], "high");
        assert_eq!(payload["has_images"], true);
        assert_eq!(payload["image_count"], 1);
        assert_eq!(payload["vlm_confidence"], 0.92);
    }
}
