//! Abstracción sobre Rig para los servicios de modelo de lenguaje y embeddings.
//!
//! El resto de la aplicación sólo ve los traits [`Embedder`] y [`ChatModel`];
//! `LlmManager` es la implementación real (OpenAI vía Rig) y los tests usan
//! implementaciones falsas.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel; // <- para .embed_texts

use crate::config::{AppConfig, LlmProvider};

/// Convierte textos en vectores; un vector por texto, en el mismo orden.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Una llamada de chat: instrucciones de sistema + mensaje de usuario.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, preamble: &str, prompt: &str) -> Result<String>;
}

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        }
    }

    async fn embed_with_openai(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};
        // Trait para client.embedding_model(...)
        use rig::client::EmbeddingsClient as _;

        let client = openai::Client::from_env();
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let embeddings = embedding_model.embed_texts(texts.to_vec()).await?;

        if embeddings.len() != texts.len() {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                texts.len()
            ));
        }

        Ok(embeddings
            .into_iter()
            .map(|emb| emb.vec.into_iter().map(|x| x as f32).collect())
            .collect())
    }

    async fn complete_with_openai(&self, preamble: &str, prompt: &str) -> Result<String> {
        use rig::providers::openai;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        let client = openai::Client::from_env();
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o"
        } else {
            self.chat_model.as_str()
        };

        let agent = client
            .agent(model_name)
            .preamble(preamble)
            .temperature(0.0)
            .build();

        let answer = agent.prompt(prompt).await?;
        Ok(answer)
    }
}

#[async_trait]
impl Embedder for LlmManager {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(texts).await,
        }
    }
}

#[async_trait]
impl ChatModel for LlmManager {
    async fn complete(&self, preamble: &str, prompt: &str) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => self.complete_with_openai(preamble, prompt).await,
        }
    }
}
