use axum::{
    Router,
    middleware as axum_middleware,
    routing::{delete, get, post},
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use moldkb::config::{Cli, Command, Config};
use moldkb::models::Severity;
use moldkb::services::ingestion::IngestionOptions;
use moldkb::services::llm::LlmClient;
use moldkb::services::searcher::RerankClient;
use moldkb::services::vlm::HttpVlmClient;
use moldkb::utils::JwtUtil;
use moldkb::{
    AppState, AuditService, CaseIndexer, EmbeddingClient, HybridSearcher, IngestionPipeline,
    KnowledgeRepository, QueryExpander, RbacService, SemanticSearcher, TextToSqlGenerator,
    TsCache, VectorStore, VlmJobStore, db, handlers, middleware,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::query::query,
        handlers::query::refresh_synonyms,
        handlers::case::ingest_case,
        handlers::case::delete_case,
        handlers::case::get_stats,
        handlers::vlm_webhook::vlm_webhook,
    ),
    components(
        schemas(
            moldkb::models::QueryRequest,
            moldkb::models::QueryResponse,
            moldkb::models::SearchMode,
            moldkb::models::SearchFilters,
            moldkb::models::RankedResult,
            moldkb::models::SearchItem,
            moldkb::models::CaseHit,
            moldkb::models::IssueHit,
            moldkb::models::SqlRowHit,
            moldkb::models::StatsResponse,
            moldkb::models::UserContext,
            moldkb::models::VlmWebhookPayload,
            Severity,
            handlers::case::IngestRequest,
        )
    ),
    tags(
        (name = "Query", description = "Hybrid retrieval over the case corpus"),
        (name = "Cases", description = "Case ingestion and lifecycle"),
        (name = "System", description = "Statistics and health"),
        (name = "VLM", description = "VLM job callbacks"),
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // .env is optional; real deployments use APP_* variables or config.toml
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(3);
        }
    };

    init_tracing(&config);
    tracing::info!("moldkb starting up");

    let state = match build_state(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Command::Ingest { file, limit, validate_mappings, no_vlm }) => {
            let options = IngestionOptions {
                limit,
                validate_mappings: validate_mappings || config.ingestion.validate_mappings,
                vlm_enrich: !no_vlm && config.ingestion.vlm_enrich,
                auto_correct_threshold: None,
            };
            run_ingest(&state, &file, &options).await;
        }
        Some(Command::DeleteCase { case_id }) => match state.indexer.delete_case(&case_id).await {
            Ok(()) => println!("Deleted case {}", case_id),
            Err(e) => {
                eprintln!("Delete failed: {}", e);
                std::process::exit(1);
            }
        },
        Some(Command::Stats) => match collect_stats(&state).await {
            Ok(stats) => println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default()),
            Err(e) => {
                eprintln!("Stats failed: {}", e);
                std::process::exit(1);
            }
        },
        None => serve(state, &config).await,
    }
}

fn init_tracing(config: &Config) {
    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("moldkb.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // keep the writer alive for the process lifetime
        std::mem::forget(guard);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn build_state(config: Config) -> Result<Arc<AppState>, Box<dyn std::error::Error>> {
    let pool = db::create_pool(&config.database.url, config.database.max_connections).await?;
    tracing::info!("Database pool created and migrations applied");

    let vector_store = Arc::new(VectorStore::connect(&config.vector)?);
    vector_store.ensure_collections().await?;

    let cache = Arc::new(TsCache::connect(&config.cache.url, config.cache.enabled).await);
    let knowledge = Arc::new(KnowledgeRepository::new(pool.clone()));

    let llm = Arc::new(LlmClient::new(&config.services.llm_url, &config.services.llm_model));
    let embeddings = Arc::new(EmbeddingClient::new(&config.services.embeddings_url));
    let reranker = Arc::new(RerankClient::new(&config.services.reranker_url));

    let vlm_job_store = Arc::new(VlmJobStore::default());
    let vlm = Arc::new(HttpVlmClient::new(
        &config.services.vlm_url,
        config.services.vlm_webhook_url.clone(),
        Arc::clone(&vlm_job_store),
    ));

    let expander = Arc::new(QueryExpander::new(Arc::clone(&knowledge), llm.clone()));
    let sql_generator = Arc::new(TextToSqlGenerator::new(
        pool.clone(),
        llm.clone(),
        Arc::clone(&knowledge),
        "knowledge",
    ));
    let semantic_searcher = Arc::new(SemanticSearcher::new(
        Arc::clone(&vector_store),
        embeddings.clone(),
        reranker,
        llm,
        Arc::clone(&cache),
    ));
    let hybrid_searcher = Arc::new(HybridSearcher::new(
        Arc::clone(&expander),
        Arc::clone(&sql_generator),
        Arc::clone(&semantic_searcher),
        Arc::clone(&cache),
        Arc::clone(&knowledge),
    ));

    let indexer = Arc::new(CaseIndexer::new(pool.clone(), Arc::clone(&vector_store), embeddings));
    let ingestion = Arc::new(IngestionPipeline::new(
        vlm,
        Arc::clone(&indexer),
        config.ingestion.clone(),
        Duration::from_secs(config.services.vlm_job_timeout_secs),
    )?);

    let rbac = Arc::new(RbacService::new(&config.rbac).await?);
    let audit = Arc::new(AuditService::new(pool.clone()));

    Ok(Arc::new(AppState {
        db: pool,
        config,
        cache,
        knowledge,
        vector_store,
        expander,
        sql_generator,
        semantic_searcher,
        hybrid_searcher,
        indexer,
        ingestion,
        vlm_job_store,
        rbac,
        audit,
    }))
}

async fn run_ingest(state: &Arc<AppState>, file: &str, options: &IngestionOptions) {
    let path = std::path::Path::new(file);
    match state.ingestion.ingest_case(path, options).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        }
        Err(e) => {
            eprintln!("Ingestion failed: {}", e);
            let code = match e.error_code() {
                2001..=2999 => 2,
                5002 => 1,
                4002 => 3,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}

async fn collect_stats(state: &Arc<AppState>) -> Result<serde_json::Value, moldkb::ApiError> {
    let relational = state.knowledge.table_counts().await?;
    let case_points = state
        .vector_store
        .point_count(&state.vector_store.case_collection)
        .await?;
    let issue_points = state
        .vector_store
        .point_count(&state.vector_store.issue_collection)
        .await?;

    Ok(serde_json::json!({
        "relational": relational,
        "vector": {"cases": case_points, "issues": issue_points},
        "cache": state.cache.get_stats(),
    }))
}

async fn serve(state: Arc<AppState>, config: &Config) {
    let auth_state = middleware::AuthState {
        jwt_util: Arc::new(JwtUtil::new(&config.auth.jwt_secret)),
    };

    let api_routes = Router::new()
        .route("/api/query", post(handlers::query::query))
        .route("/api/synonyms/refresh", post(handlers::query::refresh_synonyms))
        .route("/api/cases/ingest", post(handlers::case::ingest_case))
        .route("/api/cases/:case_id", delete(handlers::case::delete_case))
        .route("/api/stats", get(handlers::case::get_stats))
        .with_state(Arc::clone(&state))
        .layer(axum_middleware::from_fn_with_state(auth_state, middleware::auth_middleware));

    let webhook_routes = Router::new()
        .route("/api/vlm/webhook", post(handlers::vlm_webhook::vlm_webhook))
        .with_state(Arc::clone(&state));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check));

    let app = Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_routes)
        .merge(webhook_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);
    tracing::info!("moldkb is ready to serve requests");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}
