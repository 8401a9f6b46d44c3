//! Errores tipados de las etapas del pipeline (ingesta y consulta).
//!
//! `anyhow` se sigue usando en el arranque y en el código de pegamento;
//! en las fronteras entre componentes se devuelve `PipelineError` para que
//! el estado del job y las respuestas HTTP puedan informar del tipo de fallo.

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuración inválida: {0}")]
    Configuration(String),

    #[error("no se pudo obtener el repositorio: {0}")]
    Fetch(String),

    #[error("fallo al generar embeddings: {0}")]
    Embedding(String),

    #[error("fallo en la clasificación de ámbito: {0}")]
    Classification(String),

    #[error("fallo al generar la respuesta: {0}")]
    Generation(String),

    #[error("fallo en el índice vectorial: {0}")]
    VectorIndex(String),

    /// Fallo del propio servicio (tarea abortada, estado imposible), no de una dependencia.
    #[error("error interno: {0}")]
    Internal(String),
}

/// Tipo de error expuesto en el estado del job y en las respuestas de la API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    FetchFailure,
    EmbeddingFailure,
    ClassificationFailure,
    GenerationFailure,
    VectorIndexFailure,
    InternalError,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::Fetch(_) => ErrorKind::FetchFailure,
            Self::Embedding(_) => ErrorKind::EmbeddingFailure,
            Self::Classification(_) => ErrorKind::ClassificationFailure,
            Self::Generation(_) => ErrorKind::GenerationFailure,
            Self::VectorIndex(_) => ErrorKind::VectorIndexFailure,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
