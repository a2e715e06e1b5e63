//! Adaptive semantic searcher over the dual vector collections.
//!
//! Pipeline: optional LLM granularity routing, vector search, cross-encoder
//! rerank with score caching, metadata boosting. A reranker outage degrades
//! to vector-score ordering instead of failing the search.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{
    CaseHit, Granularity, IssueHit, RankedResult, SearchFilters, SearchItem,
};
use crate::services::cache::TsCache;
use crate::services::embedding_client::Embeddings;
use crate::services::llm::{LlmService, extract_json};
use crate::services::vector_store::{VectorHit, VectorStore};
use crate::utils::{ApiError, ApiResult};

const CASE_SCORE_THRESHOLD: f32 = 0.5;
const ISSUE_SCORE_THRESHOLD: f32 = 0.4;
/// Retrieval multiplier before reranking
const RERANK_CANDIDATE_FACTOR: u64 = 3;
/// Boost for solutions that worked in any trial
const SUCCESS_BOOST: f64 = 1.15;
/// Boost when the payload's part number appears in the query
const PART_NUMBER_BOOST: f64 = 1.3;

// ============================================================================
// Reranker client
// ============================================================================

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns (candidate index, relevance score) pairs
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> ApiResult<Vec<(usize, f64)>>;
}

pub struct RerankClient {
    http_client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankEntry>,
}

#[derive(Deserialize)]
struct RerankEntry {
    index: usize,
    score: f64,
}

impl RerankClient {
    pub fn new(base_url: &str) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self { http_client, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl Reranker for RerankClient {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> ApiResult<Vec<(usize, f64)>> {
        let url = format!("{}/rerank", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({
                "query": query,
                "documents": documents,
                "top_k": top_k,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::timeout("rerank request", 30)
                } else {
                    ApiError::dependency("reranker", e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::dependency("reranker", format!("API error {}: {}", status, body)));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| ApiError::dependency("reranker", format!("parse error: {}", e)))?;

        Ok(parsed.results.into_iter().map(|r| (r.index, r.score)).collect())
    }
}

// ============================================================================
// Semantic searcher
// ============================================================================

#[derive(Debug)]
pub struct SemanticResponse {
    pub query: String,
    pub mode: Granularity,
    pub results: Vec<RankedResult>,
    pub total_found: usize,
    /// Set when a degraded path was taken (e.g. reranker unavailable)
    pub dependency_error: Option<String>,
}

pub struct SemanticSearcher {
    vector_store: Arc<VectorStore>,
    embeddings: Arc<dyn Embeddings>,
    reranker: Arc<dyn Reranker>,
    llm: Arc<dyn LlmService>,
    cache: Arc<TsCache>,
}

impl SemanticSearcher {
    pub fn new(
        vector_store: Arc<VectorStore>,
        embeddings: Arc<dyn Embeddings>,
        reranker: Arc<dyn Reranker>,
        llm: Arc<dyn LlmService>,
        cache: Arc<TsCache>,
    ) -> Self {
        Self { vector_store, embeddings, reranker, llm, cache }
    }

    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
        classify: bool,
    ) -> ApiResult<SemanticResponse> {
        tracing::info!("Semantic search: \"{}\"", query);

        let mode = if classify {
            self.classify_granularity(query).await
        } else {
            Granularity::IssueLevel
        };
        tracing::debug!("Granularity: {}", mode.as_str());

        let mut dependency_error = None;
        let results = match mode {
            Granularity::CaseLevel => self.search_cases(query, top_k, filters).await?,
            Granularity::IssueLevel => {
                self.search_issues(query, top_k, filters, &mut dependency_error)
                    .await?
            }
            Granularity::Hybrid => {
                let case_results = self
                    .search_cases(query, (top_k / 2).max(1), filters)
                    .await?;
                let issue_results = self
                    .search_issues(query, top_k, filters, &mut dependency_error)
                    .await?;
                merge_by_score(case_results, issue_results, top_k)
            }
        };

        Ok(SemanticResponse {
            query: query.to_string(),
            mode,
            total_found: results.len(),
            results,
            dependency_error,
        })
    }

    /// LLM routing between case- and issue-granularity; issue level on any
    /// failure since it is by far the most common.
    async fn classify_granularity(&self, query: &str) -> Granularity {
        let prompt = format!(
            r#"你是一个搜索意图分类器。分析用户查询并确定搜索粒度。

用户查询: "{query}"

判断标准:
- CASE_LEVEL: 查询整个案件的信息
  例如: "零件1947688的所有问题", "HIPS材料的案例", "2025年9月的案件"

- ISSUE_LEVEL: 查询特定问题或解决方案
  例如: "产品披锋的解决方法", "模具表面污染", "火花纹问题"

- HYBRID: 需要两个层级的信息
  例如: "披锋问题的案例有哪些", "显示所有T1成功的解决方案"

只返回JSON格式，不要其他说明:
{{"mode": "CASE_LEVEL|ISSUE_LEVEL|HYBRID", "confidence": 0.0-1.0, "reasoning": "简短解释"}}"#
        );

        match self.llm.complete(&prompt, 100).await {
            Ok(content) => match extract_json(&content)
                .and_then(|v| v.get("mode").and_then(|m| m.as_str()).map(str::to_string))
                .as_deref()
            {
                Some("CASE_LEVEL") => Granularity::CaseLevel,
                Some("ISSUE_LEVEL") => Granularity::IssueLevel,
                Some("HYBRID") => Granularity::Hybrid,
                _ => Granularity::IssueLevel,
            },
            Err(e) => {
                tracing::warn!("Query classification failed: {}, using ISSUE_LEVEL", e);
                Granularity::IssueLevel
            }
        }
    }

    async fn embed_query(&self, query: &str) -> ApiResult<Vec<f32>> {
        if let Some(cached) = self.cache.get_embedding(query).await {
            return Ok(cached);
        }
        let vector = self.embeddings.embed(query).await?;
        self.cache.set_embedding(query, &vector).await;
        Ok(vector)
    }

    async fn search_cases(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
    ) -> ApiResult<Vec<RankedResult>> {
        let vector = self.embed_query(query).await?;
        let hits = self
            .vector_store
            .search(
                &self.vector_store.case_collection,
                vector,
                top_k as u64,
                CASE_SCORE_THRESHOLD,
                filters,
            )
            .await?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let case: CaseHit = serde_json::from_value(hit.payload).ok()?;
                Some(RankedResult {
                    item: SearchItem::Case(case),
                    score: hit.score as f64,
                    sources: Vec::new(),
                })
            })
            .collect())
    }

    async fn search_issues(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
        dependency_error: &mut Option<String>,
    ) -> ApiResult<Vec<RankedResult>> {
        let vector = self.embed_query(query).await?;
        let hits = self
            .vector_store
            .search(
                &self.vector_store.issue_collection,
                vector,
                top_k as u64 * RERANK_CANDIDATE_FACTOR,
                ISSUE_SCORE_THRESHOLD,
                filters,
            )
            .await?;

        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let candidates: Vec<(f64, IssueHit)> = hits
            .into_iter()
            .filter_map(|hit: VectorHit| {
                let issue: IssueHit = serde_json::from_value(hit.payload).ok()?;
                Some((hit.score as f64, issue))
            })
            .collect();

        let reranked = match self.rerank_candidates(query, &candidates, top_k).await {
            Ok(scores) => scores,
            Err(e) => {
                tracing::warn!("Reranking failed: {}, using vector scores", e);
                *dependency_error = Some(format!("reranker unavailable: {}", e));
                candidates
                    .iter()
                    .take(top_k)
                    .enumerate()
                    .map(|(idx, (score, _))| (idx, *score))
                    .collect()
            }
        };

        let mut results: Vec<RankedResult> = reranked
            .into_iter()
            .filter_map(|(idx, score)| {
                let (_, issue) = candidates.get(idx)?;
                let boosted = boost_score(score, issue, query);
                Some(RankedResult {
                    item: SearchItem::Issue(issue.clone()),
                    score: boosted,
                    sources: Vec::new(),
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    /// Rerank over problem + solution + image descriptions, with the score
    /// cache keyed on (query, sorted issue ids).
    async fn rerank_candidates(
        &self,
        query: &str,
        candidates: &[(f64, IssueHit)],
        top_k: usize,
    ) -> ApiResult<Vec<(usize, f64)>> {
        let doc_ids: Vec<String> =
            candidates.iter().map(|(_, issue)| issue.issue_id.clone()).collect();

        if let Some(cached) = self.cache.get_rerank_scores(query, &doc_ids).await {
            let mut scored: Vec<(usize, f64)> = candidates
                .iter()
                .enumerate()
                .filter_map(|(idx, (_, issue))| {
                    cached.get(&issue.issue_id).map(|score| (idx, *score))
                })
                .collect();
            if scored.len() == candidates.len() {
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(top_k);
                return Ok(scored);
            }
        }

        let documents: Vec<String> = candidates
            .iter()
            .map(|(_, issue)| {
                let mut doc = format!("{} {}", issue.problem, issue.solution);
                for description in &issue.vl_descriptions {
                    doc.push(' ');
                    doc.push_str(description);
                }
                doc
            })
            .collect();

        let reranked = self.reranker.rerank(query, &documents, top_k).await?;

        let scores: HashMap<String, f64> = reranked
            .iter()
            .filter_map(|(idx, score)| {
                candidates.get(*idx).map(|(_, issue)| (issue.issue_id.clone(), *score))
            })
            .collect();
        self.cache.set_rerank_scores(query, &doc_ids, &scores).await;

        Ok(reranked)
    }
}

/// Metadata boosts applied after reranking. Boosts are multiplicative and
/// deliberately indifferent to the reranker's score range.
pub fn boost_score(score: f64, issue: &IssueHit, query: &str) -> f64 {
    let mut boosted = score;

    if issue.result_t1.as_deref() == Some("OK") || issue.result_t2.as_deref() == Some("OK") {
        boosted *= SUCCESS_BOOST;
    }

    if let Some(part_number) = &issue.part_number
        && !part_number.is_empty()
        && query.contains(part_number.as_str())
    {
        boosted *= PART_NUMBER_BOOST;
    }

    boosted
}

fn merge_by_score(
    case_results: Vec<RankedResult>,
    issue_results: Vec<RankedResult>,
    top_k: usize,
) -> Vec<RankedResult> {
    let mut all: Vec<RankedResult> = case_results.into_iter().chain(issue_results).collect();
    all.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    all.truncate(top_k);
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(result_t1: Option<&str>, result_t2: Option<&str>, part: Option<&str>) -> IssueHit {
        IssueHit {
            issue_id: "TS-1-1-1-21".into(),
            case_id: "TS-1-1".into(),
            part_number: part.map(str::to_string),
            problem: "披锋".into(),
            solution: "加大锁模力".into(),
            result_t1: result_t1.map(str::to_string),
            result_t2: result_t2.map(str::to_string),
            ..IssueHit::default()
        }
    }

    #[test]
    fn successful_solutions_get_boosted() {
        let hit = issue(Some("OK"), None, None);
        assert!((boost_score(1.0, &hit, "披锋") - 1.15).abs() < 1e-9);

        let hit = issue(None, Some("OK"), None);
        assert!((boost_score(1.0, &hit, "披锋") - 1.15).abs() < 1e-9);

        let hit = issue(Some("NG"), None, None);
        assert!((boost_score(1.0, &hit, "披锋") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn part_number_mention_stacks_with_success() {
        let hit = issue(Some("OK"), None, Some("1947688"));
        let boosted = boost_score(1.0, &hit, "零件1947688的披锋");
        assert!((boosted - 1.15 * 1.3).abs() < 1e-9);
    }

    #[test]
    fn boosts_stay_multiplicative_on_unbounded_scores() {
        let hit = issue(Some("OK"), None, None);
        assert!((boost_score(7.5, &hit, "披锋") - 7.5 * 1.15).abs() < 1e-9);
    }

    #[test]
    fn merge_interleaves_by_score() {
        let case = RankedResult {
            item: SearchItem::Case(CaseHit { case_id: "c".into(), ..CaseHit::default() }),
            score: 0.9,
            sources: Vec::new(),
        };
        let low_issue = RankedResult {
            item: SearchItem::Issue(issue(None, None, None)),
            score: 0.4,
            sources: Vec::new(),
        };
        let high_issue = RankedResult {
            item: SearchItem::Issue(issue(None, None, None)),
            score: 1.2,
            sources: Vec::new(),
        };

        let merged = merge_by_score(vec![case], vec![low_issue, high_issue], 2);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].score >= merged[1].score);
        assert!((merged[0].score - 1.2).abs() < 1e-9);
    }
}
