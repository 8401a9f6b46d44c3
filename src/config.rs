//! Carga y validación de la configuración de la aplicación
//! (proveedor LLM, índice vectorial, repositorio y parámetros de chunking).
//!
//! Se lee una única vez al arrancar; cualquier error aquí es fatal.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use url::Url;

use crate::error::{PipelineError, Result};

/// Límite superior aceptado para `TOP_K`.
pub const MAX_TOP_K: usize = 100;

/// Margen para la cabecera de cada bloque de contexto (número, ruta, URL, tipo).
pub const CONTEXT_BLOCK_OVERHEAD: usize = 512;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
}

impl FromStr for LlmProvider {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            other => Err(PipelineError::Configuration(format!(
                "proveedor LLM no soportado: {other}"
            ))),
        }
    }
}

/// Backend del índice vectorial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VectorBackend {
    /// Índice en memoria con instantánea JSON en disco.
    Local { path: PathBuf },
    /// Índice vectorial nativo de Neo4j.
    Neo4j {
        uri: String,
        user: String,
        password: String,
    },
}

/// Repositorio a indexar.
#[derive(Clone, Debug)]
pub struct RepoConfig {
    pub url: String,
    pub branch: String,
    pub access_token: Option<String>,
    /// Copia local ya clonada; si existe, no se ejecuta `git clone`.
    pub local_path: Option<PathBuf>,
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,
    pub embedding_dimensions: usize,

    pub vector_backend: VectorBackend,
    pub repo: RepoConfig,

    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub embed_batch_size: usize,

    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env`, pero con una función de búsqueda inyectable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        // Rig lee la clave directamente del entorno; aquí sólo se comprueba su presencia.
        if get("OPENAI_API_KEY").is_none() {
            return Err(PipelineError::Configuration(
                "falta OPENAI_API_KEY en el entorno".into(),
            ));
        }

        let llm_provider = LlmProvider::from_str(&or("LLM_PROVIDER", "openai"))?;

        let vector_backend = match or("VECTOR_BACKEND", "local").to_lowercase().as_str() {
            "local" => VectorBackend::Local {
                path: PathBuf::from(or("VECTOR_STORE_PATH", "data/vector_store.json")),
            },
            "neo4j" => {
                let required = |key: &str| {
                    get(key).ok_or_else(|| {
                        PipelineError::Configuration(format!("falta {key} en el entorno"))
                    })
                };
                VectorBackend::Neo4j {
                    uri: required("NEO4J_URI")?,
                    user: required("NEO4J_USER")?,
                    password: required("NEO4J_PASSWORD")?,
                }
            }
            other => {
                return Err(PipelineError::Configuration(format!(
                    "VECTOR_BACKEND no soportado: {other}"
                )))
            }
        };

        let repo_url = or("REPO_URL", "https://github.com/vanna-ai/vanna");
        Url::parse(&repo_url).map_err(|e| {
            PipelineError::Configuration(format!("REPO_URL inválida '{repo_url}': {e}"))
        })?;

        let repo = RepoConfig {
            url: repo_url,
            branch: or("REPO_BRANCH", "main"),
            access_token: get("GITHUB_ACCESS_TOKEN"),
            local_path: get("REPO_LOCAL_PATH").map(PathBuf::from),
        };

        let cfg = Self {
            server_addr: or("SERVER_ADDR", "0.0.0.0:8000"),
            llm_provider,
            llm_embedding_model: or("LLM_EMBEDDING_MODEL", "text-embedding-3-small"),
            llm_chat_model: or("LLM_CHAT_MODEL", "gpt-4o"),
            embedding_dimensions: parse_number(&get, "EMBEDDING_DIMENSIONS", 1536)?,
            vector_backend,
            repo,
            chunk_size: parse_number(&get, "CHUNK_SIZE", 1000)?,
            chunk_overlap: parse_number(&get, "CHUNK_OVERLAP", 200)?,
            top_k: parse_number(&get, "TOP_K", 5)?,
            max_context_chars: parse_number(&get, "MAX_CONTEXT_CHARS", 12_000)?,
            embed_batch_size: parse_number(&get, "EMBED_BATCH_SIZE", 256)?,
            request_timeout: Duration::from_secs(parse_number(&get, "REQUEST_TIMEOUT_SECS", 60)?),
            max_retries: parse_number(&get, "MAX_RETRIES", 2)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Comprueba las dependencias entre valores numéricos.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PipelineError::Configuration("CHUNK_SIZE debe ser mayor que 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(PipelineError::Configuration(format!(
                "CHUNK_OVERLAP ({}) debe ser menor que CHUNK_SIZE ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 || self.top_k > MAX_TOP_K {
            return Err(PipelineError::Configuration(format!(
                "TOP_K debe estar entre 1 y {MAX_TOP_K}, recibido {}",
                self.top_k
            )));
        }
        if self.embed_batch_size == 0 {
            return Err(PipelineError::Configuration(
                "EMBED_BATCH_SIZE debe ser mayor que 0".into(),
            ));
        }
        if self.embedding_dimensions == 0 {
            return Err(PipelineError::Configuration(
                "EMBEDDING_DIMENSIONS debe ser mayor que 0".into(),
            ));
        }
        // Un chunk completo con su cabecera tiene que caber en el contexto.
        let min_context = self.chunk_size + CONTEXT_BLOCK_OVERHEAD;
        if self.max_context_chars < min_context {
            return Err(PipelineError::Configuration(format!(
                "MAX_CONTEXT_CHARS ({}) debe ser al menos CHUNK_SIZE + {CONTEXT_BLOCK_OVERHEAD} ({min_context})",
                self.max_context_chars
            )));
        }
        Ok(())
    }
}

fn parse_number<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| {
            PipelineError::Configuration(format!("{key} inválido '{raw}': {e}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = load(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        assert_eq!(cfg.chunk_size, 1000);
        assert_eq!(cfg.chunk_overlap, 200);
        assert_eq!(cfg.top_k, 5);
        assert_eq!(cfg.repo.branch, "main");
        assert_eq!(cfg.repo.url, "https://github.com/vanna-ai/vanna");
        assert!(matches!(cfg.vector_backend, VectorBackend::Local { .. }));
    }

    #[test]
    fn missing_api_key_is_configuration_error() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn overlap_not_smaller_than_chunk_size_is_rejected() {
        let err = load(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("CHUNK_SIZE", "400"),
            ("CHUNK_OVERLAP", "400"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("CHUNK_OVERLAP"));
    }

    #[test]
    fn context_budget_must_hold_a_full_chunk() {
        let err = load(&[("OPENAI_API_KEY", "k"), ("CHUNK_SIZE", "20000")]).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains("MAX_CONTEXT_CHARS"));

        assert!(load(&[("OPENAI_API_KEY", "k"), ("MAX_CONTEXT_CHARS", "0")]).is_err());

        let cfg = load(&[
            ("OPENAI_API_KEY", "k"),
            ("CHUNK_SIZE", "20000"),
            ("MAX_CONTEXT_CHARS", "20600"),
        ])
        .unwrap();
        assert_eq!(cfg.max_context_chars, 20_600);
    }

    #[test]
    fn top_k_bounds_are_enforced() {
        assert!(load(&[("OPENAI_API_KEY", "k"), ("TOP_K", "0")]).is_err());
        assert!(load(&[("OPENAI_API_KEY", "k"), ("TOP_K", "101")]).is_err());
        assert_eq!(load(&[("OPENAI_API_KEY", "k"), ("TOP_K", "100")]).unwrap().top_k, 100);
    }

    #[test]
    fn neo4j_backend_requires_credentials() {
        let err = load(&[("OPENAI_API_KEY", "k"), ("VECTOR_BACKEND", "neo4j")]).unwrap_err();
        assert!(err.to_string().contains("NEO4J_URI"));

        let cfg = load(&[
            ("OPENAI_API_KEY", "k"),
            ("VECTOR_BACKEND", "neo4j"),
            ("NEO4J_URI", "bolt://localhost:7687"),
            ("NEO4J_USER", "neo4j"),
            ("NEO4J_PASSWORD", "secret"),
        ])
        .unwrap();
        assert!(matches!(cfg.vector_backend, VectorBackend::Neo4j { .. }));
    }

    #[test]
    fn invalid_numbers_and_urls_are_rejected() {
        assert!(load(&[("OPENAI_API_KEY", "k"), ("CHUNK_SIZE", "abc")]).is_err());
        assert!(load(&[("OPENAI_API_KEY", "k"), ("REPO_URL", "not a url")]).is_err());
        assert!(load(&[("OPENAI_API_KEY", "k"), ("LLM_PROVIDER", "gemini")]).is_err());
    }
}
