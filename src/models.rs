//! Modelos de dominio del pipeline de ingesta y del resultado de consulta.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Espacio de nombres para los ids deterministas de chunk (UUIDv5).
const CHUNK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a52_8d3e_4b8f_a0c4_3e5d_9b7a_1c20);

/// Tipo de fichero inferido a partir de la extensión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Python,
    Rust,
    JavaScript,
    TypeScript,
    Markdown,
    Notebook,
    Json,
    Yaml,
    Toml,
    Html,
    Css,
    Text,
}

impl FileType {
    /// Deriva el tipo desde la ruta; extensiones desconocidas → `Text`.
    pub fn from_path(path: &str) -> Self {
        let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        let extension = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
            _ => return Self::Text,
        };
        match extension.as_str() {
            "py" => Self::Python,
            "rs" => Self::Rust,
            "js" | "jsx" | "mjs" => Self::JavaScript,
            "ts" | "tsx" => Self::TypeScript,
            "md" | "markdown" => Self::Markdown,
            "ipynb" => Self::Notebook,
            "json" => Self::Json,
            "yaml" | "yml" => Self::Yaml,
            "toml" => Self::Toml,
            "html" | "htm" => Self::Html,
            "css" => Self::Css,
            _ => Self::Text,
        }
    }

    /// `true` para ficheros de código fuente (frente a documentación o datos).
    pub fn is_source_code(self) -> bool {
        matches!(
            self,
            Self::Python | Self::Rust | Self::JavaScript | Self::TypeScript | Self::Notebook
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Rust => "rust",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Markdown => "markdown",
            Self::Notebook => "notebook",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Html => "html",
            Self::Css => "css",
            Self::Text => "text",
        }
    }
}

/// Fichero del repositorio tal y como se obtuvo. Inmutable.
#[derive(Debug, Clone)]
pub struct Document {
    /// Ruta relativa a la raíz del repositorio, separada por `/`.
    pub path: String,
    pub text: String,
    pub file_type: FileType,
}

impl Document {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        let path = path.into().replace('\\', "/");
        let file_type = FileType::from_path(&path);
        Self {
            path,
            text: text.into(),
            file_type,
        }
    }

    /// Tamaño del contenido en bytes.
    pub fn size(&self) -> usize {
        self.text.len()
    }
}

/// Último segmento de una ruta normalizada con `/`.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Trozo contiguo del texto de un documento.
/// `start` y `end` son offsets en caracteres; `end` es exclusivo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub parent_path: String,
    /// Heredados del documento de origen.
    pub file_type: FileType,
    pub file_size: usize,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

/// Metadatos de procedencia de un chunk. Todos obligatorios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source_path: String,
    #[serde(default)]
    pub file_name: String,
    pub github_url: String,
    #[serde(default)]
    pub raw_url: String,
    pub file_type: FileType,
    /// Tamaño en bytes del fichero completo.
    #[serde(default)]
    pub file_size: usize,
    pub chunk_index: usize,
}

/// Chunk con sus metadatos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedChunk {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub metadata: ChunkMetadata,
}

impl EnrichedChunk {
    /// Identidad estable `(ruta, índice)`; el índice vectorial sobrescribe por este id.
    pub fn chunk_id(&self) -> String {
        chunk_id(&self.metadata.source_path, self.metadata.chunk_index)
    }
}

pub fn chunk_id(path: &str, chunk_index: usize) -> String {
    let name = format!("{path}#{chunk_index}");
    Uuid::new_v5(&CHUNK_ID_NAMESPACE, name.as_bytes()).to_string()
}

/// Chunk enriquecido con su embedding.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: EnrichedChunk,
    pub vector: Vec<f32>,
}

/// Fuente citada en una respuesta.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceRef {
    pub path: String,
    pub github_url: String,
}

/// Fragmento de contexto devuelto junto al resultado de una consulta.
#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    pub path: String,
    pub file_name: String,
    pub github_url: String,
    pub raw_url: String,
    pub file_type: FileType,
    pub chunk_index: usize,
    pub score: f32,
}

/// Desglose de latencias por etapa, en milisegundos.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    pub scope_detection_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_ms: Option<f64>,
    pub total_ms: f64,
}

/// Resultado de una consulta. Se crea por petición y nunca se comparte.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub answer: String,
    pub in_scope: bool,
    pub sources: Vec<SourceRef>,
    pub timings: StageTimings,
    pub context: Vec<ContextEntry>,
}

/// Turno previo de conversación enviado por el cliente.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}
