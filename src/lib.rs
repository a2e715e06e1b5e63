//! moldkb library
//!
//! Hybrid retrieval engine over an industrial mold-defect case corpus:
//! spreadsheet ingestion with image anchoring, VLM validation/enrichment,
//! dual vector + relational indexing, and a query pipeline routing between
//! text-to-SQL, semantic search, and RRF-fused hybrid retrieval.

use sqlx::PgPool;
use std::sync::Arc;

pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use services::{
    AuditService, CaseIndexer, EmbeddingClient, HybridSearcher, IngestionPipeline,
    KnowledgeRepository, QueryExpander, RbacService, SemanticSearcher, TextToSqlGenerator,
    TsCache, VectorStore, VlmJobStore,
};
pub use utils::{ApiError, ApiResult, JwtUtil};

/// Application shared state
///
/// Design Philosophy: Keep it simple - Rust's type system IS our DI container.
/// All services are wrapped in Arc for cheap cloning and thread safety.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,

    pub cache: Arc<TsCache>,
    pub knowledge: Arc<KnowledgeRepository>,
    pub vector_store: Arc<VectorStore>,

    pub expander: Arc<QueryExpander>,
    pub sql_generator: Arc<TextToSqlGenerator>,
    pub semantic_searcher: Arc<SemanticSearcher>,
    pub hybrid_searcher: Arc<HybridSearcher>,

    pub indexer: Arc<CaseIndexer>,
    pub ingestion: Arc<IngestionPipeline>,
    pub vlm_job_store: Arc<VlmJobStore>,

    pub rbac: Arc<RbacService>,
    pub audit: Arc<AuditService>,
}
