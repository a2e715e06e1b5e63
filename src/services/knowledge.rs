//! Knowledge repository: synonyms, learnings, validated queries, query log.
//!
//! These tables feed the query expander and the text-to-SQL context layers
//! and are updated by the learning paths.

use sqlx::PgPool;

use crate::models::{Learning, Synonym, ValidatedQuery};
use crate::utils::ApiResult;

pub struct KnowledgeRepository {
    pool: PgPool,
}

impl KnowledgeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Synonyms
    // ========================================================================

    /// All synonym mappings ordered by confidence descending, so the first
    /// mapping per surface form wins when building the in-memory table.
    pub async fn load_synonyms(&self) -> ApiResult<Vec<Synonym>> {
        let rows = sqlx::query_as::<_, Synonym>(
            r#"
            SELECT canonical_term, synonym, term_type, confidence, usage_count
            FROM troubleshooting_synonyms
            ORDER BY confidence DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Defect-term groups for the text-to-SQL synonym context layer
    pub async fn defect_synonym_groups(&self) -> ApiResult<Vec<(String, Vec<String>)>> {
        let rows: Vec<(String, Vec<String>)> = sqlx::query_as(
            r#"
            SELECT canonical_term, array_agg(synonym) AS synonyms
            FROM troubleshooting_synonyms
            WHERE term_type = 'defect'
            GROUP BY canonical_term
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn learn_synonym(
        &self,
        canonical_term: &str,
        synonym: &str,
        term_type: &str,
        confidence: f64,
    ) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO troubleshooting_synonyms
                (canonical_term, synonym, term_type, confidence, source)
            VALUES ($1, $2, $3, $4, 'learned')
            ON CONFLICT (canonical_term, synonym) DO UPDATE
            SET confidence = GREATEST(troubleshooting_synonyms.confidence, EXCLUDED.confidence),
                usage_count = troubleshooting_synonyms.usage_count + 1
            "#,
        )
        .bind(canonical_term)
        .bind(synonym)
        .bind(term_type)
        .bind(confidence)
        .execute(&self.pool)
        .await?;

        tracing::info!("Learned synonym: '{}' -> '{}'", synonym, canonical_term);
        Ok(())
    }

    pub async fn record_synonym_usage(&self, synonym: &str) -> ApiResult<()> {
        sqlx::query(
            r#"
            UPDATE troubleshooting_synonyms
            SET usage_count = usage_count + 1, last_used_at = NOW()
            WHERE synonym = $1
            "#,
        )
        .bind(synonym)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Learnings
    // ========================================================================

    pub async fn top_learnings(&self, limit: i64) -> ApiResult<Vec<Learning>> {
        let rows = sqlx::query_as::<_, Learning>(
            r#"
            SELECT title, learning, learning_type, tables_affected, usage_count
            FROM ts_learnings
            ORDER BY usage_count DESC, created_at DESC
            LIMIT $1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn save_learning(
        &self,
        title: &str,
        learning: &str,
        learning_type: &str,
        tables_affected: &[String],
    ) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ts_learnings (title, learning, learning_type, tables_affected)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(title)
        .bind(learning)
        .bind(learning_type)
        .bind(tables_affected)
        .execute(&self.pool)
        .await?;

        tracing::info!("Saved learning: {}", title);
        Ok(())
    }

    // ========================================================================
    // Validated queries
    // ========================================================================

    pub async fn load_validated_queries(&self) -> ApiResult<Vec<ValidatedQuery>> {
        let rows = sqlx::query_as::<_, ValidatedQuery>(
            r#"
            SELECT name, question, sql_query, tables_used, summary
            FROM ts_knowledge_queries
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn save_validated_query(
        &self,
        name: &str,
        question: &str,
        sql: &str,
        tables_used: &[String],
        summary: Option<&str>,
    ) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ts_knowledge_queries (name, question, sql_query, tables_used, summary)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(name)
        .bind(question)
        .bind(sql)
        .bind(tables_used)
        .bind(summary)
        .execute(&self.pool)
        .await?;

        tracing::info!("Saved validated query: {}", name);
        Ok(())
    }

    // ========================================================================
    // Query log
    // ========================================================================

    /// Best-effort query logging; failures are logged, never surfaced.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_query(
        &self,
        original: &str,
        expanded: &str,
        intent: &str,
        sql: Option<&str>,
        result_count: i64,
        execution_time_ms: i64,
        session_id: Option<&str>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO ts_query_log
                (original_query, expanded_query, intent_classification,
                 generated_sql, result_count, execution_time_ms, session_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(original)
        .bind(expanded)
        .bind(intent)
        .bind(sql)
        .bind(result_count)
        .bind(execution_time_ms)
        .bind(session_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!("Failed to log query: {}", e);
        }
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub async fn table_counts(&self) -> ApiResult<serde_json::Value> {
        let cases: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM troubleshooting_cases")
            .fetch_one(&self.pool)
            .await?;
        let issues: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM troubleshooting_issues")
            .fetch_one(&self.pool)
            .await?;
        let synonyms: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM troubleshooting_synonyms")
            .fetch_one(&self.pool)
            .await?;

        Ok(serde_json::json!({
            "cases": cases.0,
            "issues": issues.0,
            "synonyms": synonyms.0,
        }))
    }
}
