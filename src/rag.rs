//! Flujo de consulta RAG sobre el repositorio indexado.
//!
//! Máquina de estados explícita:
//!   1. Clasificación de ámbito (una llamada al LLM).
//!   2. Fuera de ámbito: mensaje fijo, sin tocar embeddings, índice ni generador.
//!   3. Dentro de ámbito: embedding de la consulta y búsqueda top-K.
//!   4. Generación de la respuesta con los chunks recuperados.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::answer::AnswerGenerator;
use crate::embedding::EmbeddingGateway;
use crate::error::{PipelineError, Result};
use crate::models::{ChatTurn, ContextEntry, EnrichedChunk, QueryResult, StageTimings};
use crate::scope::ScopeClassifier;
use crate::vector_store::VectorIndex;

/// Respuesta para consultas que no tratan sobre el repositorio.
pub const OUT_OF_SCOPE_ANSWER: &str = "This question does not appear to be related to the \
indexed repository. I can only answer questions about its code, documentation and usage.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Classifying,
    OutOfScopeResponding,
    Retrieving,
    Generating,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    VerdictOutOfScope,
    VerdictInScope,
    ChunksRetrieved,
    AnswerProduced,
}

impl WorkflowState {
    /// Tabla de transiciones. `None` si el evento no es válido en este estado.
    pub fn transition(self, event: WorkflowEvent) -> Option<WorkflowState> {
        use WorkflowEvent::*;
        use WorkflowState::*;
        match (self, event) {
            (Classifying, VerdictOutOfScope) => Some(OutOfScopeResponding),
            (Classifying, VerdictInScope) => Some(Retrieving),
            (Retrieving, ChunksRetrieved) => Some(Generating),
            (Generating, AnswerProduced) => Some(Done),
            (OutOfScopeResponding, AnswerProduced) => Some(Done),
            _ => None,
        }
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

pub struct QueryWorkflow {
    classifier: ScopeClassifier,
    embeddings: EmbeddingGateway,
    index: Arc<dyn VectorIndex>,
    generator: AnswerGenerator,
    top_k: usize,
}

impl QueryWorkflow {
    pub fn new(
        classifier: ScopeClassifier,
        embeddings: EmbeddingGateway,
        index: Arc<dyn VectorIndex>,
        generator: AnswerGenerator,
        top_k: usize,
    ) -> Self {
        Self {
            classifier,
            embeddings,
            index,
            generator,
            top_k,
        }
    }

    fn advance(state: &mut WorkflowState, event: WorkflowEvent) -> Result<()> {
        let current = *state;
        *state = current.transition(event).ok_or_else(|| {
            PipelineError::Internal(format!("transición inválida: {current:?} con {event:?}"))
        })?;
        Ok(())
    }

    /// Ejecuta una consulta completa. Un fallo de cualquier etapa aborta el flujo.
    pub async fn run(&self, query: &str, chat_history: &[ChatTurn]) -> Result<QueryResult> {
        let result = self.run_inner(query, chat_history).await;
        if let Err(e) = &result {
            error!("Consulta abortada ({:?}): {}", e.kind(), e);
        }
        result
    }

    async fn run_inner(&self, query: &str, chat_history: &[ChatTurn]) -> Result<QueryResult> {
        let total_start = Instant::now();
        let mut state = WorkflowState::Classifying;

        let stage = Instant::now();
        let verdict = self.classifier.classify(query).await?;
        let scope_detection_ms = elapsed_ms(stage);

        if !verdict.is_in_scope() {
            Self::advance(&mut state, WorkflowEvent::VerdictOutOfScope)?;
            Self::advance(&mut state, WorkflowEvent::AnswerProduced)?;
            info!("Consulta fuera de ámbito respondida en {:.1} ms", elapsed_ms(total_start));
            return Ok(QueryResult {
                query: query.to_string(),
                answer: OUT_OF_SCOPE_ANSWER.to_string(),
                in_scope: false,
                sources: Vec::new(),
                timings: StageTimings {
                    scope_detection_ms,
                    retrieval_ms: None,
                    generation_ms: None,
                    total_ms: elapsed_ms(total_start),
                },
                context: Vec::new(),
            });
        }
        Self::advance(&mut state, WorkflowEvent::VerdictInScope)?;

        let stage = Instant::now();
        let query_vector = self.embeddings.embed_query(query).await?;
        let hits = self.index.search(&query_vector, self.top_k).await?;
        let retrieval_ms = elapsed_ms(stage);
        info!("Recuperados {} chunks en {:.1} ms", hits.len(), retrieval_ms);
        Self::advance(&mut state, WorkflowEvent::ChunksRetrieved)?;

        let context: Vec<ContextEntry> = hits
            .iter()
            .map(|hit| ContextEntry {
                path: hit.chunk.metadata.source_path.clone(),
                file_name: hit.chunk.metadata.file_name.clone(),
                github_url: hit.chunk.metadata.github_url.clone(),
                raw_url: hit.chunk.metadata.raw_url.clone(),
                file_type: hit.chunk.metadata.file_type,
                chunk_index: hit.chunk.metadata.chunk_index,
                score: hit.score,
            })
            .collect();
        let chunks: Vec<EnrichedChunk> = hits.into_iter().map(|hit| hit.chunk).collect();

        let stage = Instant::now();
        let generated = self.generator.generate(query, &chunks, chat_history).await?;
        let generation_ms = elapsed_ms(stage);
        Self::advance(&mut state, WorkflowEvent::AnswerProduced)?;

        let total_ms = elapsed_ms(total_start);
        info!(
            "Consulta respondida: clasificación {:.1} ms, recuperación {:.1} ms, generación {:.1} ms, total {:.1} ms",
            scope_detection_ms, retrieval_ms, generation_ms, total_ms
        );

        Ok(QueryResult {
            query: query.to_string(),
            answer: generated.answer,
            in_scope: true,
            sources: generated.sources,
            timings: StageTimings {
                scope_detection_ms,
                retrieval_ms: Some(retrieval_ms),
                generation_ms: Some(generation_ms),
                total_ms,
            },
            context,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedding::tests::{test_policy, vector_for, FakeEmbedder};
    use crate::enricher::{enrich, RepoLocation};
    use crate::models::{Chunk, Document, EmbeddedChunk};
    use crate::retry::RetryPolicy;
    use crate::scope::tests::ScriptedModel;
    use crate::scope::DEFAULT_DOMAIN;
    use crate::vector_store::{LocalVectorStore, SearchHit};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Índice en memoria que cuenta las búsquedas.
    #[derive(Default)]
    pub(crate) struct CountingIndex {
        pub inner: LocalVectorStore,
        pub searches: AtomicUsize,
    }

    #[async_trait]
    impl VectorIndex for CountingIndex {
        async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
            self.inner.upsert(chunks).await
        }
        async fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<SearchHit>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.inner.search(query_vector, k).await
        }
        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }
        async fn prune(&self, keep: &HashSet<String>) -> Result<usize> {
            self.inner.prune(keep).await
        }
    }

    pub(crate) fn vanna() -> RepoLocation {
        RepoLocation::new("https://github.com/vanna-ai/vanna", "main")
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            timeout: Duration::from_secs(2),
            base_backoff: Duration::from_millis(1),
        }
    }

    pub(crate) async fn seed(index: &dyn VectorIndex, files: &[(&str, &str)]) {
        let repo = vanna();
        let embedded: Vec<EmbeddedChunk> = files
            .iter()
            .map(|(path, text)| {
                let doc = Document::new(*path, *text);
                let chunk = Chunk {
                    text: text.to_string(),
                    start: 0,
                    end: text.chars().count(),
                    parent_path: doc.path.clone(),
                    file_type: doc.file_type,
                    file_size: doc.size(),
                };
                EmbeddedChunk {
                    chunk: enrich(chunk, 0, &repo),
                    vector: vector_for(text),
                }
            })
            .collect();
        index.upsert(&embedded).await.unwrap();
    }

    pub(crate) struct Harness {
        pub workflow: QueryWorkflow,
        pub classifier_model: Arc<ScriptedModel>,
        pub generator_model: Arc<ScriptedModel>,
        pub embedder: Arc<FakeEmbedder>,
        pub index: Arc<CountingIndex>,
    }

    /// Flujo de consulta sobre un índice ya existente (p. ej. compartido con la ingesta).
    pub(crate) fn workflow_over(
        index: Arc<dyn VectorIndex>,
        classifier_model: Arc<ScriptedModel>,
        generator_model: Arc<ScriptedModel>,
        embedder: Arc<FakeEmbedder>,
    ) -> QueryWorkflow {
        let repo = vanna();
        QueryWorkflow::new(
            ScopeClassifier::new(classifier_model, &repo, DEFAULT_DOMAIN, no_retry()),
            EmbeddingGateway::new(embedder, 16, test_policy()),
            index,
            AnswerGenerator::new(generator_model, &repo, 12_000, no_retry()),
            5,
        )
    }

    pub(crate) fn harness(
        classifier_model: ScriptedModel,
        generator_model: ScriptedModel,
        embedder: FakeEmbedder,
    ) -> Harness {
        let classifier_model = Arc::new(classifier_model);
        let generator_model = Arc::new(generator_model);
        let embedder = Arc::new(embedder);
        let index = Arc::new(CountingIndex::default());
        let workflow = workflow_over(
            index.clone(),
            classifier_model.clone(),
            generator_model.clone(),
            embedder.clone(),
        );
        Harness {
            workflow,
            classifier_model,
            generator_model,
            embedder,
            index,
        }
    }

    #[test]
    fn transition_table() {
        use WorkflowEvent::*;
        use WorkflowState::*;
        assert_eq!(Classifying.transition(VerdictOutOfScope), Some(OutOfScopeResponding));
        assert_eq!(Classifying.transition(VerdictInScope), Some(Retrieving));
        assert_eq!(Retrieving.transition(ChunksRetrieved), Some(Generating));
        assert_eq!(Generating.transition(AnswerProduced), Some(Done));
        assert_eq!(OutOfScopeResponding.transition(AnswerProduced), Some(Done));

        assert_eq!(Classifying.transition(ChunksRetrieved), None);
        assert_eq!(OutOfScopeResponding.transition(ChunksRetrieved), None);
        assert_eq!(Done.transition(VerdictInScope), None);
        assert_eq!(Generating.transition(VerdictInScope), None);
    }

    #[test]
    fn invalid_transition_is_an_internal_error() {
        let mut state = WorkflowState::Classifying;
        let err = QueryWorkflow::advance(&mut state, WorkflowEvent::AnswerProduced).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::InternalError);
        assert_eq!(state, WorkflowState::Classifying);
    }

    #[tokio::test]
    async fn out_of_scope_query_skips_retrieval_and_generation() {
        let h = harness(
            ScriptedModel::replying("OUT_OF_SCOPE"),
            ScriptedModel::replying("should not be called"),
            FakeEmbedder::default(),
        );
        seed(h.index.as_ref(), &[("README.md", "Vanna is a SQL agent")]).await;

        let result = h.workflow.run("What is the capital of France?", &[]).await.unwrap();

        assert!(!result.in_scope);
        assert_eq!(result.answer, OUT_OF_SCOPE_ANSWER);
        assert!(result.sources.is_empty());
        assert!(result.context.is_empty());
        assert!(result.timings.retrieval_ms.is_none());
        assert!(result.timings.generation_ms.is_none());
        assert_eq!(h.classifier_model.call_count(), 1);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.index.searches.load(Ordering::SeqCst), 0);
        assert_eq!(h.generator_model.call_count(), 0);
    }

    #[tokio::test]
    async fn ambiguous_verdict_is_treated_as_out_of_scope() {
        let h = harness(
            ScriptedModel::replying("Let me think about it"),
            ScriptedModel::replying("unused"),
            FakeEmbedder::default(),
        );
        let result = h.workflow.run("How does Vanna train?", &[]).await.unwrap();
        assert!(!result.in_scope);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.generator_model.call_count(), 0);
    }

    #[tokio::test]
    async fn in_scope_query_returns_answer_with_sources() {
        let h = harness(
            ScriptedModel::replying("IN_SCOPE"),
            ScriptedModel::replying("Vanna sends the question and related DDL to an LLM to write SQL."),
            FakeEmbedder::default(),
        );
        seed(
            h.index.as_ref(),
            &[
                ("src/vanna/base/base.py", "def generate_sql(self, question): prompt = self.get_sql_prompt()"),
                ("README.md", "Vanna is an MIT-licensed open-source Python RAG framework for SQL generation"),
            ],
        )
        .await;

        let result = h
            .workflow
            .run("How does Vanna convert natural language to SQL?", &[])
            .await
            .unwrap();

        assert!(result.in_scope);
        assert!(!result.answer.is_empty());
        assert!(!result.sources.is_empty());
        for source in &result.sources {
            assert!(source
                .github_url
                .starts_with("https://github.com/vanna-ai/vanna/blob/main/"));
            assert!(source.github_url.ends_with(&source.path));
        }
        assert!(result.context.iter().any(|c| c.file_type.is_source_code()));
        assert!(result.timings.retrieval_ms.is_some());
        assert!(result.timings.generation_ms.is_some());
        assert!(result.timings.total_ms >= result.timings.scope_detection_ms);
        assert_eq!(h.index.searches.load(Ordering::SeqCst), 1);
        assert_eq!(h.generator_model.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_index_gives_insufficient_context_answer() {
        let h = harness(
            ScriptedModel::replying("IN_SCOPE"),
            ScriptedModel::replying("unused"),
            FakeEmbedder::default(),
        );
        let result = h.workflow.run("What does VannaBase do?", &[]).await.unwrap();
        assert!(result.in_scope);
        assert_eq!(result.answer, crate::answer::INSUFFICIENT_CONTEXT_ANSWER);
        assert!(result.sources.is_empty());
        assert_eq!(h.generator_model.call_count(), 0);
    }

    #[tokio::test]
    async fn stage_failures_surface_as_typed_errors() {
        let h = harness(
            ScriptedModel::failing(),
            ScriptedModel::replying("unused"),
            FakeEmbedder::default(),
        );
        let err = h.workflow.run("How does Vanna work?", &[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Classification(_)));

        let h = harness(
            ScriptedModel::replying("IN_SCOPE"),
            ScriptedModel::replying("unused"),
            FakeEmbedder {
                fail: true,
                ..Default::default()
            },
        );
        let err = h.workflow.run("How does Vanna work?", &[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Embedding(_)));
        assert_eq!(h.index.searches.load(Ordering::SeqCst), 0);

        let h = harness(
            ScriptedModel::replying("IN_SCOPE"),
            ScriptedModel::failing(),
            FakeEmbedder::default(),
        );
        seed(h.index.as_ref(), &[("README.md", "Vanna")]).await;
        let err = h.workflow.run("How does Vanna work?", &[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Generation(_)));
    }
}
