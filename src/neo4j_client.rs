//! Backend Neo4j del índice vectorial: nodos `:Chunk` con su embedding y
//! un índice vectorial nativo sobre `:Chunk(embedding)`.

use std::collections::HashSet;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

use crate::error::{PipelineError, Result};
use crate::models::{file_name, ChunkMetadata, EmbeddedChunk, EnrichedChunk, FileType};
use crate::vector_store::{SearchHit, VectorIndex};

const INDEX_NAME: &str = "chunkEmbeddingIndex";

pub async fn connect(uri: &str, user: &str, password: &str) -> AnyResult<Graph> {
    let url = Url::parse(uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, user, password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Constraint de unicidad sobre `Chunk.chunk_id` e índice vectorial.
pub async fn ensure_schema(graph: &Graph, dimensions: usize) -> AnyResult<()> {
    graph
        .run(query(
            "CREATE CONSTRAINT chunk_id IF NOT EXISTS
             FOR (c:Chunk)
             REQUIRE c.chunk_id IS UNIQUE",
        ))
        .await?;

    // ¿Ya existe el índice? Usamos la sintaxis moderna SHOW VECTOR INDEXES.
    let mut cursor = graph
        .execute(
            query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                .param("name", INDEX_NAME),
        )
        .await?;

    if cursor.next().await?.is_some() {
        info!("Índice vectorial '{INDEX_NAME}' ya existe.");
        return Ok(());
    }

    let cypher = format!(
        "\
CREATE VECTOR INDEX {INDEX_NAME}
FOR (c:Chunk)
ON (c.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: 'cosine'
  }}
}}"
    );
    graph.run(query(&cypher)).await?;
    info!("Índice vectorial '{INDEX_NAME}' creado ({dimensions} dimensiones).");
    Ok(())
}

fn index_error(e: neo4rs::Error) -> PipelineError {
    PipelineError::VectorIndex(e.to_string())
}

/// Una agregación `count` siempre devuelve exactamente una fila con un entero.
fn aggregate(row: Option<neo4rs::Row>, field: &str) -> Result<i64> {
    let row = row.ok_or_else(|| {
        PipelineError::VectorIndex(format!("la agregación '{field}' no devolvió filas"))
    })?;
    row.get(field).ok_or_else(|| {
        PipelineError::VectorIndex(format!("valor inválido para '{field}' en el resultado de Neo4j"))
    })
}

pub struct Neo4jVectorStore {
    graph: Graph,
}

impl Neo4jVectorStore {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl VectorIndex for Neo4jVectorStore {
    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        let tx = self.graph.start_txn().await.map_err(index_error)?;
        for embedded in chunks {
            let chunk = &embedded.chunk;
            let embedding: Vec<f64> = embedded.vector.iter().map(|x| f64::from(*x)).collect();
            tx.run(
                query(
                    "MERGE (c:Chunk {chunk_id: $chunk_id})
                     SET c.text = $text, c.start = $start, c.end = $end,
                         c.source_path = $source_path, c.file_name = $file_name,
                         c.github_url = $github_url, c.raw_url = $raw_url,
                         c.file_type = $file_type, c.file_size = $file_size,
                         c.chunk_index = $chunk_index,
                         c.embedding = $embedding",
                )
                .param("chunk_id", chunk.chunk_id())
                .param("text", chunk.text.clone())
                .param("start", chunk.start as i64)
                .param("end", chunk.end as i64)
                .param("source_path", chunk.metadata.source_path.clone())
                .param("file_name", chunk.metadata.file_name.clone())
                .param("github_url", chunk.metadata.github_url.clone())
                .param("raw_url", chunk.metadata.raw_url.clone())
                .param("file_type", chunk.metadata.file_type.as_str())
                .param("file_size", chunk.metadata.file_size as i64)
                .param("chunk_index", chunk.metadata.chunk_index as i64)
                .param("embedding", embedding),
            )
            .await
            .map_err(index_error)?;
        }
        tx.commit().await.map_err(index_error)?;
        Ok(())
    }

    async fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let embedding: Vec<f64> = query_vector.iter().map(|x| f64::from(*x)).collect();
        let mut cursor = self
            .graph
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                     YIELD node, score
                     RETURN node.text AS text, node.start AS start, node.end AS end,
                            node.source_path AS source_path, node.file_name AS file_name,
                            node.github_url AS github_url, node.raw_url AS raw_url,
                            node.file_size AS file_size, node.chunk_index AS chunk_index, score
                     ORDER BY score DESC",
                )
                .param("index_name", INDEX_NAME)
                .param("k", k as i64)
                .param("embedding", embedding),
            )
            .await
            .map_err(index_error)?;

        let missing = |field: &str| {
            PipelineError::VectorIndex(format!("falta el campo '{field}' en el resultado de Neo4j"))
        };

        let mut hits = Vec::new();
        while let Some(row) = cursor.next().await.map_err(index_error)? {
            let source_path: String = row.get("source_path").ok_or_else(|| missing("source_path"))?;
            let chunk_index: i64 = row.get("chunk_index").ok_or_else(|| missing("chunk_index"))?;
            let start: i64 = row.get("start").ok_or_else(|| missing("start"))?;
            let end: i64 = row.get("end").ok_or_else(|| missing("end"))?;
            let score: f64 = row.get("score").ok_or_else(|| missing("score"))?;
            // Nodos escritos antes de guardar estos campos los devuelven a null.
            let name: String = row
                .get("file_name")
                .unwrap_or_else(|| file_name(&source_path).to_string());
            let raw_url: String = row.get("raw_url").unwrap_or_default();
            let file_size: i64 = row.get("file_size").unwrap_or_default();

            hits.push(SearchHit {
                chunk: EnrichedChunk {
                    text: row.get("text").ok_or_else(|| missing("text"))?,
                    start: start as usize,
                    end: end as usize,
                    metadata: ChunkMetadata {
                        file_name: name,
                        github_url: row.get("github_url").ok_or_else(|| missing("github_url"))?,
                        raw_url,
                        file_type: FileType::from_path(&source_path),
                        file_size: file_size.max(0) as usize,
                        source_path,
                        chunk_index: chunk_index as usize,
                    },
                },
                score: score as f32,
            });
        }
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        let mut cursor = self
            .graph
            .execute(query("MATCH (c:Chunk) RETURN count(c) AS n"))
            .await
            .map_err(index_error)?;
        let n: i64 = aggregate(cursor.next().await.map_err(index_error)?, "n")?;
        Ok(n as usize)
    }

    async fn prune(&self, keep: &HashSet<String>) -> Result<usize> {
        let keep: Vec<String> = keep.iter().cloned().collect();
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (c:Chunk) WHERE NOT c.chunk_id IN $keep
                     WITH c DETACH DELETE c
                     RETURN count(*) AS removed",
                )
                .param("keep", keep),
            )
            .await
            .map_err(index_error)?;
        let removed: i64 = aggregate(cursor.next().await.map_err(index_error)?, "removed")?;
        Ok(removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_without_rows_is_an_index_error() {
        let err = aggregate(None, "n").unwrap_err();
        assert!(matches!(err, PipelineError::VectorIndex(msg) if msg.contains("'n'")));
    }
}
