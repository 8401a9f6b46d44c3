//! Índice vectorial de chunks.
//!
//! API pública:
//!   - trait `VectorIndex` (`upsert`, `search`, `count`, `prune`).
//!   - `LocalVectorStore`: en memoria, similitud coseno, instantánea JSON en disco.
//!
//! El backend Neo4j vive en `neo4j_client`.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::models::{EmbeddedChunk, EnrichedChunk};

/// Resultado de una búsqueda por similitud.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: EnrichedChunk,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserta o sobrescribe por `chunk_id` (ruta + índice).
    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<()>;

    /// Los `k` chunks más similares, en orden de similitud descendente.
    async fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    async fn count(&self) -> Result<usize>;

    /// Elimina todo chunk cuyo id no esté en `keep`; devuelve cuántos se borraron.
    async fn prune(&self, keep: &HashSet<String>) -> Result<usize>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredChunk {
    chunk: EnrichedChunk,
    vector: Vec<f32>,
}

/// Índice en memoria. Si tiene ruta, cada escritura se vuelca a disco.
///
/// Las escrituras se serializan con `writer` y preparan una copia del mapa:
/// sólo se publica en `entries` cuando la instantánea ya está en disco, así
/// que un fallo de escritura deja memoria y disco como estaban y las
/// búsquedas no esperan a la E/S.
pub struct LocalVectorStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, StoredChunk>>,
    writer: Mutex<()>,
}

impl LocalVectorStore {
    /// Índice volátil, sin persistencia.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Abre (o crea) el índice persistido en `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let entries = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<HashMap<String, StoredChunk>>(&bytes)
                .map_err(|e| {
                    PipelineError::VectorIndex(format!(
                        "instantánea corrupta en {}: {e}",
                        path.display()
                    ))
                })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(PipelineError::VectorIndex(format!(
                    "no se pudo leer {}: {e}",
                    path.display()
                )))
            }
        };
        info!(
            "Índice vectorial local abierto en {} ({} chunks).",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
        })
    }

    async fn persist(&self, entries: &HashMap<String, StoredChunk>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |e: std::io::Error| {
            PipelineError::VectorIndex(format!("no se pudo escribir {}: {e}", path.display()))
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let bytes =
            serde_json::to_vec(entries).map_err(|e| PipelineError::VectorIndex(e.to_string()))?;
        // Escritura atómica: fichero temporal + rename.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }
}

impl Default for LocalVectorStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait]
impl VectorIndex for LocalVectorStore {
    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut next = self.entries.read().await.clone();
        for embedded in chunks {
            next.insert(
                embedded.chunk.chunk_id(),
                StoredChunk {
                    chunk: embedded.chunk.clone(),
                    vector: embedded.vector.clone(),
                },
            );
        }
        self.persist(&next).await?;
        *self.entries.write().await = next;
        Ok(())
    }

    async fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let entries = self.entries.read().await;
        let mut hits: Vec<SearchHit> = entries
            .values()
            .map(|stored| SearchHit {
                chunk: stored.chunk.clone(),
                score: cosine_similarity(query_vector, &stored.vector),
            })
            .collect();

        // Empates resueltos por (ruta, índice) para un orden determinista.
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.metadata.source_path.cmp(&b.chunk.metadata.source_path))
                .then_with(|| a.chunk.metadata.chunk_index.cmp(&b.chunk.metadata.chunk_index))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn prune(&self, keep: &HashSet<String>) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let mut next = self.entries.read().await.clone();
        let before = next.len();
        next.retain(|id, _| keep.contains(id));
        let removed = before - next.len();
        if removed > 0 {
            self.persist(&next).await?;
            *self.entries.write().await = next;
        }
        Ok(removed)
    }
}
