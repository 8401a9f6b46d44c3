//! Enriquecimiento de chunks con metadatos de procedencia.

use crate::config::RepoConfig;
use crate::models::{file_name, Chunk, ChunkMetadata, EnrichedChunk};

/// Ubicación pública del repositorio para construir enlaces de GitHub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocation {
    base_url: String,
    branch: String,
}

impl RepoLocation {
    pub fn new(base_url: &str, branch: &str) -> Self {
        let base_url = base_url.trim().trim_end_matches('/');
        let base_url = base_url.strip_suffix(".git").unwrap_or(base_url);
        Self {
            base_url: base_url.to_string(),
            branch: branch.trim().trim_matches('/').to_string(),
        }
    }

    pub fn from_config(repo: &RepoConfig) -> Self {
        Self::new(&repo.url, &repo.branch)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// `(owner, nombre)` extraídos de los dos últimos segmentos de la URL.
    pub fn owner_and_name(&self) -> (String, String) {
        let mut segments = self.base_url.rsplit('/');
        let name = segments.next().unwrap_or_default().to_string();
        let owner = segments.next().unwrap_or_default().to_string();
        (owner, name)
    }

    /// `<base>/blob/<rama>/<ruta>`.
    pub fn github_url(&self, path: &str) -> String {
        let path = path.replace('\\', "/");
        format!(
            "{}/blob/{}/{}",
            self.base_url,
            self.branch,
            path.trim_start_matches('/')
        )
    }

    /// `https://raw.githubusercontent.com/<owner>/<nombre>/<rama>/<ruta>`.
    pub fn raw_url(&self, path: &str) -> String {
        let (owner, name) = self.owner_and_name();
        let path = path.replace('\\', "/");
        format!(
            "https://raw.githubusercontent.com/{owner}/{name}/{}/{}",
            self.branch,
            path.trim_start_matches('/')
        )
    }
}

/// Función pura: mismas entradas, mismos metadatos (y la misma URL, byte a byte).
pub fn enrich(chunk: Chunk, chunk_index: usize, repo: &RepoLocation) -> EnrichedChunk {
    let metadata = ChunkMetadata {
        file_name: file_name(&chunk.parent_path).to_string(),
        github_url: repo.github_url(&chunk.parent_path),
        raw_url: repo.raw_url(&chunk.parent_path),
        file_type: chunk.file_type,
        file_size: chunk.file_size,
        source_path: chunk.parent_path,
        chunk_index,
    };
    EnrichedChunk {
        text: chunk.text,
        start: chunk.start,
        end: chunk.end,
        metadata,
    }
}
