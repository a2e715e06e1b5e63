//! Query expansion: ASR artifact cleanup, synonym substitution, intent
//! classification.
//!
//! The synonym table is lazy-loaded into memory and swapped wholesale on
//! `refresh()` - readers never see a half-built table. Intent falls back to
//! an LLM classifier only when the keyword sets are silent.

use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{Expansion, Intent, SynonymUse};
use crate::services::knowledge::KnowledgeRepository;
use crate::services::llm::{LlmService, extract_json};

/// Keywords suggesting SQL-friendly counting / filtering / aggregation
static STRUCTURED_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        // counting
        "多少", "几个", "数量", "总数", "统计", "count",
        // filtering
        "成功", "失败", "t1", "t2", "t0", "ok", "ng",
        // aggregation
        "分布", "占比", "比例", "百分比", "排名", "top",
        // comparison
        "最多", "最少", "最高", "最低", "平均",
        // listing with filters
        "列出", "显示", "有哪些",
    ]
});

/// Keywords suggesting semantic vector search
static SEMANTIC_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "怎么", "如何", "为什么", "原因", "方法", "方案",
        "解决", "处理", "改善", "优化",
        "类似", "相似", "相关",
        "建议", "推荐",
    ]
});

/// ASR filler tokens stripped before any other processing
const ASR_FILLERS: [&str; 11] =
    ["嗯", "啊", "呃", "那个", "就是", "然后", "这个", "那", "哦", "噢", "额"];

/// surface -> canonical, ordered longest surface first
type SynonymTable = Vec<(String, String)>;

pub struct QueryExpander {
    knowledge: Arc<KnowledgeRepository>,
    llm: Arc<dyn LlmService>,
    synonyms: RwLock<Option<Arc<SynonymTable>>>,
}

impl QueryExpander {
    pub fn new(knowledge: Arc<KnowledgeRepository>, llm: Arc<dyn LlmService>) -> Self {
        Self { knowledge, llm, synonyms: RwLock::new(None) }
    }

    pub async fn expand(&self, query: &str) -> Expansion {
        let cleaned = clean_asr(query);
        let table = self.synonym_table().await;
        let (expanded, synonyms_used) = expand_synonyms(&cleaned, &table);

        for used in &synonyms_used {
            if let Err(e) = self.knowledge.record_synonym_usage(&used.surface).await {
                tracing::debug!("Failed to record synonym usage: {}", e);
            }
        }

        let (intent, confidence) = self.classify_intent(&expanded).await;

        Expansion {
            original: query.to_string(),
            cleaned,
            expanded,
            intent,
            synonyms_used,
            confidence,
        }
    }

    /// Invalidate and rebuild the synonym table
    pub async fn refresh(&self) {
        *self.synonyms.write().await = None;
        self.synonym_table().await;
    }

    async fn synonym_table(&self) -> Arc<SynonymTable> {
        if let Some(table) = self.synonyms.read().await.clone() {
            return table;
        }

        match self.knowledge.load_synonyms().await {
            Ok(synonyms) => {
                let mut table: SynonymTable = Vec::new();
                for synonym in synonyms {
                    // highest-confidence mapping per surface form wins
                    if !table.iter().any(|(surface, _)| *surface == synonym.synonym) {
                        table.push((synonym.synonym, synonym.canonical_term));
                    }
                }
                table.sort_by_key(|(surface, _)| std::cmp::Reverse(surface.chars().count()));
                tracing::info!("Loaded {} synonyms into cache", table.len());

                let table = Arc::new(table);
                *self.synonyms.write().await = Some(Arc::clone(&table));
                table
            }
            Err(e) => {
                // not cached; the next query retries the load
                tracing::warn!("Failed to load synonym cache: {}", e);
                Arc::new(Vec::new())
            }
        }
    }

    async fn classify_intent(&self, query: &str) -> (Intent, f64) {
        if let Some(result) = classify_by_keywords(query) {
            return result;
        }
        self.classify_with_llm(query).await
    }

    async fn classify_with_llm(&self, query: &str) -> (Intent, f64) {
        let prompt = format!(
            r#"你是一个查询意图分类器。分析用户的故障排除查询并确定最佳搜索策略。

用户查询: "{query}"

分类标准:
- STRUCTURED: 需要精确过滤、计数、聚合的查询
  例如: "有多少个披锋问题", "T1成功的案例", "HIPS材料的问题数量"

- SEMANTIC: 需要语义理解、相似度搜索的查询
  例如: "披锋怎么解决", "拉白的原因是什么", "类似的问题有哪些"

- HYBRID: 需要结构化过滤 + 语义搜索的查询
  例如: "HIPS材料的披锋解决方案", "T1失败的问题怎么改善"

只返回JSON格式:
{{"intent": "STRUCTURED|SEMANTIC|HYBRID", "confidence": 0.0-1.0, "reasoning": "简短解释"}}"#
        );

        match self.llm.complete(&prompt, 100).await {
            Ok(content) => {
                if let Some(value) = extract_json(&content) {
                    let intent = match value.get("intent").and_then(|v| v.as_str()) {
                        Some("STRUCTURED") => Some(Intent::Structured),
                        Some("SEMANTIC") => Some(Intent::Semantic),
                        Some("HYBRID") => Some(Intent::Hybrid),
                        _ => None,
                    };
                    if let Some(intent) = intent {
                        let confidence =
                            value.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.7);
                        return (intent, confidence);
                    }
                }
                tracing::warn!("LLM classification returned unusable output");
            }
            Err(e) => {
                tracing::warn!("LLM classification failed: {}", e);
            }
        }

        // vector search is the safest default
        (Intent::Semantic, 0.5)
    }
}

// ============================================================================
// Pure text processing
// ============================================================================

/// Strip ASR artifacts: filler tokens, stuttered characters and words,
/// irregular whitespace.
pub fn clean_asr(query: &str) -> String {
    let mut q = query.trim().to_string();
    if q.is_empty() {
        return q;
    }

    for filler in ASR_FILLERS {
        q = q.replace(filler, "");
    }

    q = collapse_repeated_chars(&q);
    q = collapse_repeated_pairs(&q);

    q.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Runs of 3+ identical characters collapse to a single one
fn collapse_repeated_chars(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == chars[i] {
            run += 1;
        }
        if run >= 3 {
            out.push(chars[i]);
        } else {
            for _ in 0..run {
                out.push(chars[i]);
            }
        }
        i += run;
    }
    out
}

/// Immediately repeated two-character tokens collapse to one occurrence
fn collapse_repeated_pairs(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        if i + 3 < chars.len() {
            let pair = (chars[i], chars[i + 1]);
            if !pair.0.is_whitespace() && !pair.1.is_whitespace() {
                let mut repeats = 1;
                while i + repeats * 2 + 1 < chars.len()
                    && chars[i + repeats * 2] == pair.0
                    && chars[i + repeats * 2 + 1] == pair.1
                {
                    repeats += 1;
                }
                if repeats >= 2 {
                    out.push(pair.0);
                    out.push(pair.1);
                    i += repeats * 2;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Replace surface forms with canonicals, longest surface first.
pub fn expand_synonyms(query: &str, table: &SynonymTable) -> (String, Vec<SynonymUse>) {
    let mut expanded = query.to_string();
    let mut used = Vec::new();

    for (surface, canonical) in table {
        if surface != canonical && expanded.contains(surface.as_str()) {
            expanded = expanded.replace(surface.as_str(), canonical);
            tracing::debug!("Expanded '{}' -> '{}'", surface, canonical);
            used.push(SynonymUse { surface: surface.clone(), canonical: canonical.clone() });
        }
    }

    (expanded, used)
}

/// Keyword-based intent decision; None when neither set matches.
pub fn classify_by_keywords(query: &str) -> Option<(Intent, f64)> {
    let query_lower = query.to_lowercase();

    let structured = STRUCTURED_KEYWORDS
        .iter()
        .filter(|kw| query_lower.contains(**kw))
        .count();
    let semantic = SEMANTIC_KEYWORDS
        .iter()
        .filter(|kw| query_lower.contains(**kw))
        .count();

    match (structured, semantic) {
        (s, 0) if s > 0 => Some((Intent::Structured, 0.9)),
        (0, s) if s > 0 => Some((Intent::Semantic, 0.9)),
        (s, m) if s > 0 && m > 0 => Some((Intent::Hybrid, 0.8)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, &str)]) -> SynonymTable {
        let mut t: SynonymTable = entries
            .iter()
            .map(|(s, c)| (s.to_string(), c.to_string()))
            .collect();
        t.sort_by_key(|(surface, _)| std::cmp::Reverse(surface.chars().count()));
        t
    }

    #[test]
    fn fillers_and_stutters_are_removed() {
        assert_eq!(clean_asr("嗯那个我想问下毛边问题"), "我想问下毛边问题");
        assert_eq!(clean_asr("我我我想知道"), "我想知道");
        assert_eq!(clean_asr("我我想知道"), "我我想知道");
        assert_eq!(clean_asr("披锋披锋问题"), "披锋问题");
        assert_eq!(clean_asr("  多   个  空格 "), "多 个 空格");
    }

    #[test]
    fn clean_asr_is_idempotent() {
        let once = clean_asr("嗯嗯嗯那个披锋披锋怎么解决");
        assert_eq!(clean_asr(&once), once);
    }

    #[test]
    fn synonyms_replace_longest_first() {
        let table = table(&[("毛边", "披锋"), ("毛边问题", "披锋缺陷")]);
        let (expanded, used) = expand_synonyms("毛边问题有多少个", &table);
        assert_eq!(expanded, "披锋缺陷有多少个");
        assert_eq!(used.len(), 1);
        assert_eq!(used[0].surface, "毛边问题");
    }

    #[test]
    fn empty_table_yields_identity() {
        let (expanded, used) = expand_synonyms("披锋怎么解决", &Vec::new());
        assert_eq!(expanded, "披锋怎么解决");
        assert!(used.is_empty());
    }

    #[test]
    fn identity_mappings_are_not_recorded() {
        let table = table(&[("披锋", "披锋")]);
        let (expanded, used) = expand_synonyms("披锋问题", &table);
        assert_eq!(expanded, "披锋问题");
        assert!(used.is_empty());
    }

    #[test]
    fn synonym_expansion_reaches_fixed_point() {
        let table = table(&[("毛边", "披锋"), ("毛刺", "披锋")]);
        let (first, _) = expand_synonyms("毛边和毛刺怎么处理", &table);
        let (second, used) = expand_synonyms(&first, &table);
        assert_eq!(first, second);
        assert!(used.is_empty());
    }

    #[test]
    fn keyword_classification_matches_decision_table() {
        assert_eq!(classify_by_keywords("有多少个披锋问题"), Some((Intent::Structured, 0.9)));
        assert_eq!(classify_by_keywords("披锋怎么解决"), Some((Intent::Semantic, 0.9)));
        assert_eq!(
            classify_by_keywords("HIPS材料的披锋解决方案有哪些"),
            Some((Intent::Hybrid, 0.8))
        );
        assert_eq!(classify_by_keywords("披锋"), None);
    }

    #[test]
    fn trial_markers_classify_structured_case_insensitively() {
        assert_eq!(classify_by_keywords("T1成功的案例列出"), Some((Intent::Structured, 0.9)));
    }
}
