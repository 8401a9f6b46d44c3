//! Ingesta del repositorio en el índice vectorial y gestión del job de indexación.
//!
//! Flujo de un job:
//!   1. Obtener los documentos del repositorio.
//!   2. Dividir cada documento en chunks solapados y enriquecerlos con metadatos.
//!   3. Generar los embeddings en lote (mismo orden que los chunks).
//!   4. Upsert en el índice por id determinista y poda de chunks obsoletos.
//!
//! Sólo puede haber un job en ejecución por proceso: la comprobación y la
//! creación del job se hacen bajo el mismo mutex.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::spawn;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    chunker::Chunker,
    embedding::EmbeddingGateway,
    enricher::{enrich, RepoLocation},
    error::{ErrorKind, PipelineError, Result},
    models::{EmbeddedChunk, EnrichedChunk},
    repo::RepoSource,
    vector_store::VectorIndex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }
}

/// Registro de un job de indexación.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingJob {
    pub id: Uuid,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub documents_total: usize,
    pub documents_processed: usize,
    pub chunks_processed: usize,
    pub chunks_pruned: usize,
    pub duration_secs: Option<f64>,
    pub chunks_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl IndexingJob {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: JobState::Pending,
            started_at: None,
            finished_at: None,
            documents_total: 0,
            documents_processed: 0,
            chunks_processed: 0,
            chunks_pruned: 0,
            duration_secs: None,
            chunks_per_second: None,
            error: None,
            error_kind: None,
        }
    }

    fn transition(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "transición inválida {:?} -> {:?}",
            self.state,
            next
        );
        if !self.state.can_transition_to(next) {
            warn!("Transición de job ignorada: {:?} -> {:?}", self.state, next);
            return;
        }
        let now = Utc::now();
        match next {
            JobState::Running => self.started_at = Some(now),
            JobState::Succeeded | JobState::Failed => {
                self.finished_at = Some(now);
                if let Some(started) = self.started_at {
                    let secs = (now - started).num_milliseconds() as f64 / 1000.0;
                    self.duration_secs = Some(secs);
                    self.chunks_per_second =
                        (secs > 0.0).then(|| self.chunks_processed as f64 / secs);
                }
            }
            JobState::Pending => {}
        }
        self.state = next;
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}

/// Estado consultable de la indexación.
#[derive(Debug, Clone)]
pub enum IndexStatus {
    NeverIndexed,
    Job(IndexingJob),
}

/// Resultado de `start_index`.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(IndexingJob),
    AlreadyRunning(IndexingJob),
}

/// Resumen de una ejecución correcta del pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestionSummary {
    pub documents: usize,
    pub chunks: usize,
    pub pruned: usize,
}

/// Implementa cómo se mostrará el resumen como texto.
impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} documentos, {} chunks indexados, {} chunks obsoletos eliminados",
            self.documents, self.chunks, self.pruned
        )
    }
}

/// Componentes del pipeline fetch → chunk → enrich → embed → upsert.
pub struct IndexingPipeline {
    pub source: Box<dyn RepoSource>,
    pub chunker: Chunker,
    pub repo: RepoLocation,
    pub embeddings: EmbeddingGateway,
    pub index: Arc<dyn VectorIndex>,
}

impl IndexingPipeline {
    /// Ejecuta la ingesta completa. `on_progress(documentos_procesados, total)`.
    pub async fn run<F>(&self, mut on_progress: F) -> Result<IngestionSummary>
    where
        F: FnMut(usize, usize),
    {
        let documents = self.source.fetch().await?;
        let total = documents.len();
        on_progress(0, total);

        let mut enriched: Vec<EnrichedChunk> = Vec::new();
        for (processed, doc) in documents.iter().enumerate() {
            let chunks = self.chunker.split(doc);
            if chunks.is_empty() {
                warn!("Documento sin contenido, se omite: {}", doc.path);
            }
            enriched.extend(
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| enrich(chunk, i, &self.repo)),
            );
            on_progress(processed + 1, total);
        }

        let texts: Vec<String> = enriched.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embeddings.embed(&texts).await?;

        let keep: HashSet<String> = enriched.iter().map(EnrichedChunk::chunk_id).collect();
        let embedded: Vec<EmbeddedChunk> = enriched
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
            .collect();

        self.index.upsert(&embedded).await?;
        // Sólo se poda tras un upsert completo: un fallo conserva el índice anterior.
        let pruned = self.index.prune(&keep).await?;

        Ok(IngestionSummary {
            documents: total,
            chunks: embedded.len(),
            pruned,
        })
    }
}

/// Job actual y el inmediatamente anterior, bajo el mismo mutex.
#[derive(Debug, Default)]
struct JobSlots {
    current: Option<IndexingJob>,
    previous: Option<IndexingJob>,
}

/// Dueño del job actual; garantiza una única ejecución simultánea.
#[derive(Clone)]
pub struct IndexingJobManager {
    pipeline: Arc<IndexingPipeline>,
    slots: Arc<Mutex<JobSlots>>,
}

fn lock(slots: &Mutex<JobSlots>) -> MutexGuard<'_, JobSlots> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl IndexingJobManager {
    pub fn new(pipeline: IndexingPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            slots: Arc::new(Mutex::new(JobSlots::default())),
        }
    }

    /// Lanza un job si no hay ninguno en curso; si lo hay, devuelve su estado.
    pub fn start_index(&self) -> StartOutcome {
        let job = {
            let mut slots = lock(&self.slots);
            if let Some(job) = slots.current.as_ref().filter(|job| job.is_running()) {
                info!("Indexación ya en curso ({}), no se lanza otra.", job.id);
                return StartOutcome::AlreadyRunning(job.clone());
            }
            let mut job = IndexingJob::new();
            job.transition(JobState::Running);
            slots.previous = slots.current.replace(job.clone());
            job
        };

        info!("Iniciando indexación (job {}).", job.id);
        let pipeline = self.pipeline.clone();
        let progress_slots = self.slots.clone();
        let job_id = job.id;
        let run = spawn(async move {
            pipeline
                .run(move |processed, total| {
                    let mut slots = lock(&progress_slots);
                    if let Some(job) = slots.current.as_mut().filter(|j| j.id == job_id) {
                        job.documents_processed = processed;
                        job.documents_total = total;
                    }
                })
                .await
        });

        // Supervisor: el job termina aunque la tarea del pipeline haga panic.
        let slots = self.slots.clone();
        spawn(async move {
            let result = match run.await {
                Ok(result) => result,
                Err(join_err) => Err(PipelineError::Internal(format!(
                    "la tarea de indexación terminó de forma abrupta: {join_err}"
                ))),
            };
            finish(&slots, job_id, result);
        });

        StartOutcome::Started(job)
    }

    /// Job actual o el último terminado; `NeverIndexed` si nunca se lanzó ninguno.
    pub fn get_status(&self) -> IndexStatus {
        match lock(&self.slots).current.as_ref() {
            Some(job) => IndexStatus::Job(job.clone()),
            None => IndexStatus::NeverIndexed,
        }
    }

    /// Job reemplazado por el último `start_index`, con su resultado final.
    pub fn previous_job(&self) -> Option<IndexingJob> {
        lock(&self.slots).previous.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.slots)
            .current
            .as_ref()
            .map(IndexingJob::is_running)
            .unwrap_or(false)
    }
}

fn finish(slots: &Mutex<JobSlots>, job_id: Uuid, result: Result<IngestionSummary>) {
    let mut slots = lock(slots);
    let Some(job) = slots.current.as_mut().filter(|j| j.id == job_id) else {
        return;
    };
    match result {
        Ok(summary) => {
            job.documents_total = summary.documents;
            job.documents_processed = summary.documents;
            job.chunks_processed = summary.chunks;
            job.chunks_pruned = summary.pruned;
            job.transition(JobState::Succeeded);
            info!(
                "¡Indexación completada en {:.2}s! {}",
                job.duration_secs.unwrap_or_default(),
                summary
            );
        }
        Err(err) => {
            error!("Error en la indexación (job {}): {}", job.id, err);
            job.error_kind = Some(err.kind());
            job.error = Some(err.to_string());
            job.transition(JobState::Failed);
        }
    }
}
