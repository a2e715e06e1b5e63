//! Redis caching layer for the search pipeline.
//!
//! Three namespaces with different lifetimes:
//! - `ts:emb:` query embeddings, 24 h (embeddings are deterministic)
//! - `ts:search:` full search responses, 5 min (freshness vs. speed)
//! - `ts:rerank:` reranker scores, 1 h (stable for repeated queries)
//!
//! Failure-open: every Redis error is logged and swallowed; the caller simply
//! recomputes. Unreachable Redis must never take the search path down.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{QueryResponse, SearchFilters, SearchMode};
use crate::utils::{canonical_json, md5_hex};

const EMBEDDING_TTL: u64 = 24 * 60 * 60;
const SEARCH_RESULT_TTL: u64 = 5 * 60;
const RERANK_SCORE_TTL: u64 = 60 * 60;

const PREFIX_EMBEDDING: &str = "ts:emb:";
const PREFIX_SEARCH: &str = "ts:search:";
const PREFIX_RERANK: &str = "ts:rerank:";

#[derive(Default)]
struct Counters {
    embedding_hits: AtomicU64,
    embedding_misses: AtomicU64,
    search_hits: AtomicU64,
    search_misses: AtomicU64,
    rerank_hits: AtomicU64,
    rerank_misses: AtomicU64,
}

pub struct TsCache {
    conn: Option<ConnectionManager>,
    stats: Counters,
}

impl TsCache {
    /// Connect to Redis. A failed connection yields a disabled cache, not an
    /// error - the engine runs without caching.
    pub async fn connect(url: &str, enabled: bool) -> Self {
        if !enabled {
            tracing::info!("Result cache disabled by configuration");
            return Self { conn: None, stats: Counters::default() };
        }

        let conn = match redis::Client::open(url) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(conn) => {
                    tracing::info!("Result cache connected: {}", url);
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!("Redis connection failed, caching disabled: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Invalid Redis URL, caching disabled: {}", e);
                None
            }
        };

        Self { conn, stats: Counters::default() }
    }

    /// Disabled cache for tests and cache-off deployments
    pub fn disabled() -> Self {
        Self { conn: None, stats: Counters::default() }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    async fn get_raw(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Cache get failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn set_raw(&self, key: &str, value: String, ttl: u64) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl).await {
            tracing::warn!("Cache set failed for {}: {}", key, e);
        }
    }

    // ========================================================================
    // Embedding cache
    // ========================================================================

    pub async fn get_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let key = format!("{}{}", PREFIX_EMBEDDING, md5_hex(text));
        match self.get_raw(&key).await {
            Some(data) => match serde_json::from_str(&data) {
                Ok(vector) => {
                    self.stats.embedding_hits.fetch_add(1, Ordering::Relaxed);
                    Some(vector)
                }
                Err(e) => {
                    tracing::warn!("Corrupt cached embedding dropped: {}", e);
                    self.stats.embedding_misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            None => {
                self.stats.embedding_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set_embedding(&self, text: &str, embedding: &[f32]) {
        let key = format!("{}{}", PREFIX_EMBEDDING, md5_hex(text));
        if let Ok(value) = serde_json::to_string(embedding) {
            self.set_raw(&key, value, EMBEDDING_TTL).await;
        }
    }

    // ========================================================================
    // Search-result cache
    // ========================================================================

    fn search_key(
        query: &str,
        mode: SearchMode,
        filters: Option<&SearchFilters>,
        top_k: usize,
    ) -> String {
        let params = json!({
            "query": query,
            "mode": mode.as_str(),
            "filters": filters,
            "top_k": top_k,
        });
        format!("{}{}", PREFIX_SEARCH, md5_hex(&canonical_json(&params)))
    }

    pub async fn get_search_results(
        &self,
        query: &str,
        mode: SearchMode,
        filters: Option<&SearchFilters>,
        top_k: usize,
    ) -> Option<QueryResponse> {
        let key = Self::search_key(query, mode, filters, top_k);
        match self.get_raw(&key).await {
            Some(data) => match serde_json::from_str(&data) {
                Ok(response) => {
                    self.stats.search_hits.fetch_add(1, Ordering::Relaxed);
                    Some(response)
                }
                Err(e) => {
                    tracing::warn!("Corrupt cached search result dropped: {}", e);
                    self.stats.search_misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            None => {
                self.stats.search_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set_search_results(
        &self,
        query: &str,
        mode: SearchMode,
        filters: Option<&SearchFilters>,
        top_k: usize,
        response: &QueryResponse,
    ) {
        let key = Self::search_key(query, mode, filters, top_k);
        let mut cached = response.clone();
        cached._cached_at = Some(chrono::Utc::now().to_rfc3339());
        if let Ok(value) = serde_json::to_string(&cached) {
            self.set_raw(&key, value, SEARCH_RESULT_TTL).await;
        }
    }

    // ========================================================================
    // Rerank score cache
    // ========================================================================

    fn rerank_key(query: &str, doc_ids: &[String]) -> String {
        let mut sorted = doc_ids.to_vec();
        sorted.sort();
        let params = json!({"query": query, "doc_ids": sorted});
        format!("{}{}", PREFIX_RERANK, md5_hex(&canonical_json(&params)))
    }

    pub async fn get_rerank_scores(
        &self,
        query: &str,
        doc_ids: &[String],
    ) -> Option<HashMap<String, f64>> {
        let key = Self::rerank_key(query, doc_ids);
        match self.get_raw(&key).await {
            Some(data) => match serde_json::from_str(&data) {
                Ok(scores) => {
                    self.stats.rerank_hits.fetch_add(1, Ordering::Relaxed);
                    Some(scores)
                }
                Err(_) => {
                    self.stats.rerank_misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            None => {
                self.stats.rerank_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set_rerank_scores(
        &self,
        query: &str,
        doc_ids: &[String],
        scores: &HashMap<String, f64>,
    ) {
        let key = Self::rerank_key(query, doc_ids);
        if let Ok(value) = serde_json::to_string(scores) {
            self.set_raw(&key, value, RERANK_SCORE_TTL).await;
        }
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn get_stats(&self) -> serde_json::Value {
        let embedding_hits = self.stats.embedding_hits.load(Ordering::Relaxed);
        let embedding_misses = self.stats.embedding_misses.load(Ordering::Relaxed);
        let search_hits = self.stats.search_hits.load(Ordering::Relaxed);
        let search_misses = self.stats.search_misses.load(Ordering::Relaxed);
        let rerank_hits = self.stats.rerank_hits.load(Ordering::Relaxed);
        let rerank_misses = self.stats.rerank_misses.load(Ordering::Relaxed);

        fn rate(hits: u64, misses: u64) -> f64 {
            let total = hits + misses;
            if total == 0 { 0.0 } else { hits as f64 / total as f64 }
        }

        json!({
            "enabled": self.is_enabled(),
            "embedding_hits": embedding_hits,
            "embedding_misses": embedding_misses,
            "embedding_hit_rate": rate(embedding_hits, embedding_misses),
            "search_hits": search_hits,
            "search_misses": search_misses,
            "search_hit_rate": rate(search_hits, search_misses),
            "rerank_hits": rerank_hits,
            "rerank_misses": rerank_misses,
            "rerank_hit_rate": rate(rerank_hits, rerank_misses),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_key_is_stable_under_filter_field_order() {
        let filters = SearchFilters { material: Some("HIPS".into()), ..Default::default() };
        let a = TsCache::search_key("披锋", SearchMode::Hybrid, Some(&filters), 10);
        let b = TsCache::search_key("披锋", SearchMode::Hybrid, Some(&filters), 10);
        assert_eq!(a, b);
    }

    #[test]
    fn search_key_varies_with_params() {
        let a = TsCache::search_key("披锋", SearchMode::Hybrid, None, 10);
        let b = TsCache::search_key("披锋", SearchMode::Semantic, None, 10);
        let c = TsCache::search_key("披锋", SearchMode::Hybrid, None, 5);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rerank_key_ignores_doc_order() {
        let a = TsCache::rerank_key("q", &["b".into(), "a".into()]);
        let b = TsCache::rerank_key("q", &["a".into(), "b".into()]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn disabled_cache_is_failure_open() {
        let cache = TsCache::disabled();
        assert!(!cache.is_enabled());
        assert!(cache.get_embedding("text").await.is_none());
        cache.set_embedding("text", &[0.1, 0.2]).await;
        assert!(cache.get_embedding("text").await.is_none());
    }
}
