//! Hybrid search orchestration.
//!
//! Routes between text-to-SQL and semantic retrieval based on the expanded
//! query's intent; HYBRID runs both branches on concurrent tasks and fuses
//! them with Reciprocal Rank Fusion. Responses are cached for a short TTL
//! keyed on the caller's exact request.

use std::sync::Arc;
use std::time::Instant;

use crate::models::{
    QueryResponse, RankedResult, SearchFilters, SearchItem, SearchMode, SearchSource, SqlRowHit,
};
use crate::services::cache::TsCache;
use crate::services::knowledge::KnowledgeRepository;
use crate::services::query_expander::QueryExpander;
use crate::services::searcher::SemanticSearcher;
use crate::services::text_to_sql::TextToSqlGenerator;
use crate::utils::ApiResult;

/// RRF ranking constant
const RRF_K: f64 = 60.0;

#[derive(Debug, Default)]
struct BranchResult {
    results: Vec<RankedResult>,
    sql: Option<String>,
    error: Option<String>,
    dependency_error: Option<String>,
}

pub struct HybridSearcher {
    expander: Arc<QueryExpander>,
    sql_generator: Arc<TextToSqlGenerator>,
    semantic: Arc<SemanticSearcher>,
    cache: Arc<TsCache>,
    knowledge: Arc<KnowledgeRepository>,
}

impl HybridSearcher {
    pub fn new(
        expander: Arc<QueryExpander>,
        sql_generator: Arc<TextToSqlGenerator>,
        semantic: Arc<SemanticSearcher>,
        cache: Arc<TsCache>,
        knowledge: Arc<KnowledgeRepository>,
    ) -> Self {
        Self { expander, sql_generator, semantic, cache, knowledge }
    }

    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        top_k: usize,
        filters: Option<&SearchFilters>,
        return_sql: bool,
    ) -> ApiResult<QueryResponse> {
        tracing::info!("Hybrid search: \"{}\" (mode={})", query, mode.as_str());
        let started = Instant::now();

        if let Some(cached) = self
            .cache
            .get_search_results(query, mode, filters, top_k)
            .await
        {
            tracing::info!("Cache hit for query");
            return Ok(cached);
        }

        let expansion = self.expander.expand(query).await;
        let resolved_mode = match mode {
            SearchMode::Auto => SearchMode::from(expansion.intent),
            other => other,
        };
        tracing::info!(
            "Intent: {} ({}), mode: {}",
            expansion.intent.as_str(),
            expansion.confidence,
            resolved_mode.as_str()
        );

        let branch = match resolved_mode {
            SearchMode::Structured => {
                structured_branch(
                    Arc::clone(&self.sql_generator),
                    Arc::clone(&self.semantic),
                    expansion.expanded.clone(),
                    top_k,
                    filters.cloned(),
                )
                .await
            }
            SearchMode::Semantic => {
                semantic_branch(
                    Arc::clone(&self.semantic),
                    expansion.expanded.clone(),
                    top_k,
                    filters.cloned(),
                )
                .await
            }
            SearchMode::Hybrid | SearchMode::Auto => {
                self.search_fused(&expansion.expanded, top_k, filters).await
            }
        };

        let mut response = QueryResponse {
            query: query.to_string(),
            expanded_query: expansion.expanded.clone(),
            mode: resolved_mode,
            intent_confidence: expansion.confidence,
            synonyms_used: expansion.synonyms_used,
            total_found: branch.results.len(),
            results: branch.results,
            generated_sql: None,
            error: branch.error,
            dependency_error: branch.dependency_error,
            _cached_at: None,
        };
        if return_sql {
            response.generated_sql = branch.sql.clone();
        }

        if response.error.is_none() {
            self.cache
                .set_search_results(query, mode, filters, top_k, &response)
                .await;
        }

        self.knowledge
            .log_query(
                query,
                &response.expanded_query,
                expansion.intent.as_str(),
                branch.sql.as_deref(),
                response.total_found as i64,
                started.elapsed().as_millis() as i64,
                None,
            )
            .await;

        Ok(response)
    }

    /// HYBRID: both branches on concurrent tasks with per-task failure
    /// isolation, fused with RRF.
    async fn search_fused(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
    ) -> BranchResult {
        let branch_k = top_k * 2;

        let structured_task = tokio::spawn(structured_branch(
            Arc::clone(&self.sql_generator),
            Arc::clone(&self.semantic),
            query.to_string(),
            branch_k,
            filters.cloned(),
        ));
        let semantic_task = tokio::spawn(semantic_branch(
            Arc::clone(&self.semantic),
            query.to_string(),
            branch_k,
            filters.cloned(),
        ));

        let structured = match structured_task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Parallel structured task failed: {}", e);
                BranchResult::default()
            }
        };
        let semantic = match semantic_task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Parallel semantic task failed: {}", e);
                BranchResult::default()
            }
        };

        let mut fused = reciprocal_rank_fusion(structured.results, semantic.results, RRF_K);
        fused.truncate(top_k);

        BranchResult {
            results: fused,
            sql: structured.sql,
            // partial results are acceptable in hybrid mode
            error: None,
            dependency_error: structured.dependency_error.or(semantic.dependency_error),
        }
    }
}

/// STRUCTURED branch: text-to-SQL, extra filters spliced into WHERE.
/// Invalid SQL falls back to the semantic branch rather than failing.
async fn structured_branch(
    sql_generator: Arc<TextToSqlGenerator>,
    semantic: Arc<SemanticSearcher>,
    query: String,
    top_k: usize,
    filters: Option<SearchFilters>,
) -> BranchResult {
    let generation = sql_generator.generate(&query, None).await;

    let Some(mut sql) = generation.sql else {
        tracing::warn!(
            "SQL generation failed: {}; falling back to semantic search",
            generation.error.as_deref().unwrap_or("unknown")
        );
        return semantic_branch(semantic, query, top_k, filters).await;
    };

    if let Some(filters) = &filters {
        sql = apply_sql_filters(&sql, filters);
    }

    match sql_generator.execute(&sql, top_k).await {
        Ok(execution) => {
            let results = execution
                .rows
                .iter()
                .map(|row| {
                    let mut columns = serde_json::Map::new();
                    for (name, value) in execution.columns.iter().zip(row.iter()) {
                        columns.insert(name.clone(), value.clone());
                    }
                    RankedResult {
                        item: SearchItem::SqlRow(SqlRowHit { columns }),
                        score: 0.0,
                        sources: vec![SearchSource::Structured],
                    }
                })
                .collect();
            BranchResult { results, sql: Some(sql), error: None, dependency_error: None }
        }
        Err(e) => {
            tracing::warn!("SQL execution failed: {}", e);
            BranchResult {
                results: Vec::new(),
                sql: Some(sql),
                error: Some(e.to_string()),
                dependency_error: None,
            }
        }
    }
}

async fn semantic_branch(
    semantic: Arc<SemanticSearcher>,
    query: String,
    top_k: usize,
    filters: Option<SearchFilters>,
) -> BranchResult {
    match semantic.search(&query, top_k, filters.as_ref(), true).await {
        Ok(response) => BranchResult {
            results: response
                .results
                .into_iter()
                .map(|mut result| {
                    result.sources = vec![SearchSource::Semantic];
                    result
                })
                .collect(),
            sql: None,
            error: None,
            dependency_error: response.dependency_error,
        },
        Err(e) => BranchResult {
            results: Vec::new(),
            sql: None,
            error: Some(e.to_string()),
            dependency_error: None,
        },
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// Reciprocal Rank Fusion: score += 1/(k + rank) per list, results deduped on
/// issue_id / case_id / problem hash, sources accumulated.
pub fn reciprocal_rank_fusion(
    structured: Vec<RankedResult>,
    semantic: Vec<RankedResult>,
    k: f64,
) -> Vec<RankedResult> {
    let mut order: Vec<String> = Vec::new();
    let mut fused: std::collections::HashMap<String, RankedResult> =
        std::collections::HashMap::new();

    let mut absorb = |results: Vec<RankedResult>, source: SearchSource| {
        for (rank, result) in results.into_iter().enumerate() {
            let key = result.item.dedup_key();
            let rrf = 1.0 / (k + (rank + 1) as f64);
            match fused.get_mut(&key) {
                Some(existing) => {
                    existing.score += rrf;
                    if !existing.sources.contains(&source) {
                        existing.sources.push(source);
                    }
                }
                None => {
                    let mut entry = result;
                    entry.score = rrf;
                    entry.sources = vec![source];
                    order.push(key.clone());
                    fused.insert(key, entry);
                }
            }
        }
    };

    absorb(structured, SearchSource::Structured);
    absorb(semantic, SearchSource::Semantic);

    let mut results: Vec<RankedResult> = order
        .into_iter()
        .filter_map(|key| fused.remove(&key))
        .collect();
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results
}

// ============================================================================
// Filter splicing
// ============================================================================

/// Splice caller-supplied filters into generated SQL, extending an existing
/// WHERE clause or inserting one before ORDER BY / GROUP BY / LIMIT.
pub fn apply_sql_filters(sql: &str, filters: &SearchFilters) -> String {
    let mut conditions = Vec::new();
    if let Some(part_number) = &filters.part_number {
        conditions.push(format!("part_number = '{}'", escape_literal(part_number)));
    }
    if let Some(material) = &filters.material {
        conditions.push(format!("material ILIKE '%{}%'", escape_literal(material)));
    }
    if let Some(trial_version) = &filters.trial_version {
        conditions.push(format!("trial_version = '{}'", escape_literal(trial_version)));
    }

    if conditions.is_empty() {
        return sql.to_string();
    }
    let clause = conditions.join(" AND ");

    let upper = sql.to_uppercase();
    if let Some(idx) = upper.find("WHERE") {
        let after = sql[idx + 5..].trim_start();
        return format!("{} ({}) AND {}", &sql[..idx + 5], clause, after);
    }

    for keyword in ["ORDER BY", "GROUP BY", "LIMIT"] {
        if let Some(idx) = upper.find(keyword) {
            return format!("{} WHERE {} {}", sql[..idx].trim_end(), clause, &sql[idx..]);
        }
    }

    format!("{} WHERE {}", sql.trim_end_matches(';').trim_end(), clause)
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IssueHit;

    fn issue_result(issue_id: &str, score: f64) -> RankedResult {
        RankedResult {
            item: SearchItem::Issue(IssueHit {
                issue_id: issue_id.into(),
                case_id: "TS-1-1".into(),
                problem: "披锋".into(),
                ..IssueHit::default()
            }),
            score,
            sources: Vec::new(),
        }
    }

    fn sql_row_result(issue_id: &str) -> RankedResult {
        let mut columns = serde_json::Map::new();
        columns.insert("issue_id".into(), serde_json::Value::String(issue_id.into()));
        columns.insert("problem".into(), serde_json::Value::String("披锋".into()));
        RankedResult {
            item: SearchItem::SqlRow(SqlRowHit { columns }),
            score: 0.0,
            sources: vec![SearchSource::Structured],
        }
    }

    #[test]
    fn rrf_sums_scores_for_shared_results() {
        let structured = vec![sql_row_result("issue-a"), sql_row_result("issue-b")];
        let semantic = vec![issue_result("issue-a", 0.9), issue_result("issue-c", 0.8)];

        let fused = reciprocal_rank_fusion(structured, semantic, 60.0);

        assert_eq!(fused.len(), 3);
        // issue-a appears in both lists at rank 1: 2/(60+1)
        let top = &fused[0];
        assert_eq!(top.item.dedup_key(), "issue-a");
        assert!((top.score - 2.0 / 61.0).abs() < 1e-9);
        assert!(top.sources.contains(&SearchSource::Structured));
        assert!(top.sources.contains(&SearchSource::Semantic));

        for result in &fused[1..] {
            assert_eq!(result.sources.len(), 1);
            assert!(result.score < top.score);
        }
    }

    #[test]
    fn rrf_scores_are_finite_and_ordered() {
        let structured: Vec<RankedResult> =
            (0..50).map(|i| sql_row_result(&format!("issue-{}", i))).collect();
        let fused = reciprocal_rank_fusion(structured, Vec::new(), 60.0);
        assert!(fused.iter().all(|r| r.score.is_finite()));
        assert!(fused.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn rrf_dedup_key_spans_sql_rows_and_issue_hits() {
        let structured = vec![sql_row_result("TS-1-1-1-21")];
        let semantic = vec![issue_result("TS-1-1-1-21", 0.9)];
        let fused = reciprocal_rank_fusion(structured, semantic, 60.0);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].sources.len(), 2);
    }

    #[test]
    fn filters_extend_existing_where() {
        let filters =
            SearchFilters { material: Some("HIPS".into()), ..SearchFilters::default() };
        let sql = "SELECT * FROM troubleshooting_issues WHERE result_t1 = 'OK' LIMIT 50";
        let spliced = apply_sql_filters(sql, &filters);
        assert!(spliced.contains("WHERE (material ILIKE '%HIPS%') AND result_t1 = 'OK'"));
    }

    #[test]
    fn filters_insert_where_before_limit() {
        let filters =
            SearchFilters { part_number: Some("1947688".into()), ..SearchFilters::default() };
        let sql = "SELECT * FROM troubleshooting_issues LIMIT 50";
        let spliced = apply_sql_filters(sql, &filters);
        assert_eq!(
            spliced,
            "SELECT * FROM troubleshooting_issues WHERE part_number = '1947688' LIMIT 50"
        );
    }

    #[test]
    fn filters_append_where_without_modifiers() {
        let filters =
            SearchFilters { trial_version: Some("T1".into()), ..SearchFilters::default() };
        let spliced = apply_sql_filters("SELECT * FROM troubleshooting_issues;", &filters);
        assert_eq!(
            spliced,
            "SELECT * FROM troubleshooting_issues WHERE trial_version = 'T1'"
        );
    }

    #[test]
    fn filter_values_escape_quotes() {
        let filters =
            SearchFilters { material: Some("HI'PS".into()), ..SearchFilters::default() };
        let spliced = apply_sql_filters("SELECT * FROM troubleshooting_issues", &filters);
        assert!(spliced.contains("ILIKE '%HI''PS%'"));
    }

    #[test]
    fn empty_filters_leave_sql_untouched() {
        let sql = "SELECT COUNT(*) FROM troubleshooting_issues";
        assert_eq!(apply_sql_filters(sql, &SearchFilters::default()), sql);
    }
}
