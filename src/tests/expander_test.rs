// End-to-end expansion flow against an unreachable synonym table and a
// scripted LLM: keyword routing, LLM fallback, and its degraded default.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::models::Intent;
use crate::services::KnowledgeRepository;
use crate::services::QueryExpander;

use super::common::{FakeLlm, lazy_pool};

fn expander_with(llm: FakeLlm) -> QueryExpander {
    let knowledge = Arc::new(KnowledgeRepository::new(lazy_pool()));
    QueryExpander::new(knowledge, Arc::new(llm))
}

#[tokio::test]
async fn counting_query_is_structured_without_llm() {
    let llm = FakeLlm::unavailable();
    let expander = expander_with(llm);

    let expansion = expander.expand("有多少个披锋问题").await;
    assert_eq!(expansion.intent, Intent::Structured);
    assert!((expansion.confidence - 0.9).abs() < f64::EPSILON);
    assert_eq!(expansion.expanded, "有多少个披锋问题");
    assert!(expansion.synonyms_used.is_empty());
}

#[tokio::test]
async fn solution_query_is_semantic() {
    let expander = expander_with(FakeLlm::unavailable());
    let expansion = expander.expand("披锋怎么解决").await;
    assert_eq!(expansion.intent, Intent::Semantic);
    assert!((expansion.confidence - 0.9).abs() < f64::EPSILON);
}

#[tokio::test]
async fn mixed_query_is_hybrid() {
    let expander = expander_with(FakeLlm::unavailable());
    let expansion = expander.expand("HIPS材料的披锋解决方案有哪些").await;
    assert_eq!(expansion.intent, Intent::Hybrid);
    assert!((expansion.confidence - 0.8).abs() < f64::EPSILON);
}

#[tokio::test]
async fn asr_noise_is_scrubbed_before_classification() {
    let expander = expander_with(FakeLlm::unavailable());
    let expansion = expander.expand("嗯那个有多少个披锋问题").await;
    assert_eq!(expansion.cleaned, "有多少个披锋问题");
    assert_eq!(expansion.intent, Intent::Structured);
}

#[tokio::test]
async fn keywordless_query_falls_back_to_llm() {
    let llm = FakeLlm::with_responses(&[r#"{"intent": "HYBRID", "confidence": 0.75}"#]);
    let expander = expander_with(llm);

    let expansion = expander.expand("披锋").await;
    assert_eq!(expansion.intent, Intent::Hybrid);
    assert!((expansion.confidence - 0.75).abs() < f64::EPSILON);
}

#[tokio::test]
async fn llm_outage_defaults_to_semantic() {
    let llm = FakeLlm::unavailable();
    let expander = expander_with(llm);

    let expansion = expander.expand("披锋").await;
    assert_eq!(expansion.intent, Intent::Semantic);
    assert!((expansion.confidence - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn keyword_hits_never_consult_the_llm() {
    let llm = FakeLlm::with_responses(&[r#"{"intent": "STRUCTURED", "confidence": 1.0}"#]);
    let expander = expander_with(llm);

    let expansion = expander.expand("披锋怎么解决").await;
    assert_eq!(expansion.intent, Intent::Semantic);
    // 'calls' lives on the fake; the response queue must be untouched
    let second = expander.expand("拉白的原因").await;
    assert_eq!(second.intent, Intent::Semantic);
}

#[tokio::test]
async fn expansion_is_a_fixed_point() {
    let expander = expander_with(FakeLlm::unavailable());
    let first = expander.expand("有多少个披锋问题").await;
    let second = expander.expand(&first.expanded).await;
    assert_eq!(second.expanded, first.expanded);
}

#[tokio::test]
async fn fake_llm_consumes_responses_in_order() {
    let llm = FakeLlm::with_responses(&["first", "second"]);
    use crate::services::llm::LlmService;
    assert_eq!(llm.complete("p", 10).await.unwrap(), "first");
    assert_eq!(llm.complete("p", 10).await.unwrap(), "second");
    assert!(llm.complete("p", 10).await.is_err());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
}
