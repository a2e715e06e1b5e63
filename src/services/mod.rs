pub mod audit_service;
pub mod cache;
pub mod embedding_client;
pub mod extractor;
pub mod hybrid_searcher;
pub mod indexer;
pub mod ingestion;
pub mod knowledge;
pub mod llm;
pub mod query_expander;
pub mod rbac_service;
pub mod searcher;
pub mod text_to_sql;
pub mod validation;
pub mod vector_store;
pub mod vlm;

pub use audit_service::AuditService;
pub use cache::TsCache;
pub use embedding_client::{EmbeddingClient, Embeddings};
pub use extractor::CaseExtractor;
pub use hybrid_searcher::HybridSearcher;
pub use indexer::{CaseIndexer, IndexStats};
pub use ingestion::{IngestReport, IngestionOptions, IngestionPipeline};
pub use knowledge::KnowledgeRepository;
pub use llm::{LlmClient, LlmService};
pub use query_expander::QueryExpander;
pub use rbac_service::RbacService;
pub use searcher::{RerankClient, Reranker, SemanticSearcher};
pub use text_to_sql::TextToSqlGenerator;
pub use validation::ValidationPipeline;
pub use vector_store::VectorStore;
pub use vlm::{HttpVlmClient, VlmEnricher, VlmJobStore, VlmService};
