use std::sync::Arc;

use crate::{
    config::AppConfig, enricher::RepoLocation, ingest::IndexingJobManager, rag::QueryWorkflow,
    vector_store::VectorIndex,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repo: RepoLocation,
    pub jobs: IndexingJobManager,
    pub workflow: Arc<QueryWorkflow>,
    // El mismo índice que usan el pipeline y el flujo de consulta.
    pub index: Arc<dyn VectorIndex>,
}
