// Módulos de la aplicación
mod answer;
mod api;
mod app_state;
mod chunker;
mod config;
mod embedding;
mod enricher;
mod error;
mod ingest;
mod llm;
mod models;
mod neo4j_client;
mod rag;
mod repo;
mod retry;
mod scope;
mod vector_store;

use std::sync::Arc;

use anyhow::Context;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    answer::AnswerGenerator,
    app_state::AppState,
    chunker::Chunker,
    config::{AppConfig, VectorBackend},
    embedding::EmbeddingGateway,
    enricher::RepoLocation,
    ingest::{IndexingJobManager, IndexingPipeline},
    llm::LlmManager,
    rag::QueryWorkflow,
    repo::source_from_config,
    retry::RetryPolicy,
    scope::{ScopeClassifier, DEFAULT_DOMAIN},
    vector_store::{LocalVectorStore, VectorIndex},
};

fn init_tracing() {
    // RUST_LOG tiene prioridad; si no, LOG_LEVEL (por defecto "info").
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_vector_index(cfg: &AppConfig) -> anyhow::Result<Arc<dyn VectorIndex>> {
    match &cfg.vector_backend {
        VectorBackend::Local { path } => {
            let store = LocalVectorStore::open(path)
                .await
                .context("Error abriendo el índice vectorial local")?;
            Ok(Arc::new(store))
        }
        VectorBackend::Neo4j {
            uri,
            user,
            password,
        } => {
            let graph = neo4j_client::connect(uri, user, password)
                .await
                .context("Error conectando a Neo4j")?;
            neo4j_client::ensure_schema(&graph, cfg.embedding_dimensions)
                .await
                .context("Error asegurando el esquema de Neo4j")?;
            Ok(Arc::new(neo4j_client::Neo4jVectorStore::new(graph)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    init_tracing();

    // 2. Cargar configuración (un error aquí aborta el arranque)
    let cfg = Arc::new(AppConfig::from_env().context("Error al cargar la configuración")?);
    let repo = RepoLocation::from_config(&cfg.repo);
    info!(
        "Repositorio objetivo: {} (rama {})",
        repo.base_url(),
        repo.branch()
    );

    // 3. Índice vectorial
    let index = open_vector_index(&cfg).await?;

    // 4. Proveedor LLM y componentes del pipeline
    let llm = Arc::new(LlmManager::from_config(&cfg));
    let policy = RetryPolicy::new(cfg.max_retries, cfg.request_timeout);
    let chunker = Chunker::new(cfg.chunk_size, cfg.chunk_overlap)?;
    info!(
        "Chunks de {} caracteres con solapamiento de {}; top_k = {}",
        chunker.max_chars(),
        chunker.overlap(),
        cfg.top_k
    );

    let pipeline = IndexingPipeline {
        source: source_from_config(&cfg.repo),
        chunker,
        repo: repo.clone(),
        embeddings: EmbeddingGateway::new(llm.clone(), cfg.embed_batch_size, policy),
        index: index.clone(),
    };

    let workflow = QueryWorkflow::new(
        ScopeClassifier::new(llm.clone(), &repo, DEFAULT_DOMAIN, policy),
        EmbeddingGateway::new(llm.clone(), cfg.embed_batch_size, policy),
        index.clone(),
        AnswerGenerator::new(llm, &repo, cfg.max_context_chars, policy),
        cfg.top_k,
    );

    // 5. Estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        repo,
        jobs: IndexingJobManager::new(pipeline),
        workflow: Arc::new(workflow),
        index,
    };

    // 6. Router de la API
    let app = api::create_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
