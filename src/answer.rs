//! Generación de la respuesta a partir de los chunks recuperados.

use std::sync::Arc;

use tracing::{info, warn};

use crate::enricher::RepoLocation;
use crate::error::{PipelineError, Result};
use crate::llm::ChatModel;
use crate::models::{ChatTurn, EnrichedChunk, SourceRef};
use crate::retry::{with_retry, RetryPolicy};

/// Respuesta cuando no se recuperó ningún chunk.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str = "I could not find enough information in the indexed \
repository to answer this question. Try rephrasing it or asking about a specific module, \
function or file.";

/// Respuesta estructurada del generador.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedAnswer {
    pub answer: String,
    /// Fuentes de los chunks incluidos en el prompt, sin duplicados, en orden de ranking.
    pub sources: Vec<SourceRef>,
}

/// Contexto ya recortado al presupuesto de caracteres.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub text: String,
    pub included: usize,
    pub sources: Vec<SourceRef>,
}

/// Concatena los chunks en orden de ranking mientras quepan en `max_chars`.
/// Se descartan primero los de menor ranking.
pub fn build_context(chunks: &[EnrichedChunk], max_chars: usize) -> PromptContext {
    let mut text = String::new();
    let mut used = 0;
    let mut sources: Vec<SourceRef> = Vec::new();
    let mut included = 0;

    for (rank, chunk) in chunks.iter().enumerate() {
        let block = format!(
            "Document {}:\nSource: {}\nGitHub URL: {}\nFile type: {}\nContent:\n{}\n\n",
            rank + 1,
            chunk.metadata.source_path,
            chunk.metadata.github_url,
            chunk.metadata.file_type.as_str(),
            chunk.text
        );
        let block_len = block.chars().count();
        if used + block_len > max_chars {
            break;
        }
        used += block_len;
        text.push_str(&block);
        included += 1;

        let source = SourceRef {
            path: chunk.metadata.source_path.clone(),
            github_url: chunk.metadata.github_url.clone(),
        };
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    PromptContext {
        text,
        included,
        sources,
    }
}

/// Historial válido (`user`/`assistant`) renderizado como texto.
fn render_history(history: &[ChatTurn]) -> String {
    let mut out = String::new();
    for turn in history {
        let role = turn.role.trim().to_lowercase();
        if role != "user" && role != "assistant" {
            warn!("Turno de historial con rol desconocido '{}', se omite", turn.role);
            continue;
        }
        if turn.content.trim().is_empty() {
            continue;
        }
        out.push_str(&format!("{role}: {}\n", turn.content.trim()));
    }
    out
}

pub struct AnswerGenerator {
    model: Arc<dyn ChatModel>,
    preamble: String,
    max_context_chars: usize,
    policy: RetryPolicy,
}

impl AnswerGenerator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        repo: &RepoLocation,
        max_context_chars: usize,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            model,
            preamble: build_preamble(repo),
            max_context_chars,
            policy,
        }
    }

    /// Prompt de usuario completo: contexto, historial y pregunta.
    pub fn build_prompt(&self, query: &str, context: &PromptContext, history: &[ChatTurn]) -> String {
        let mut prompt = format!("Context information is below:\n\n{}", context.text);
        let history = render_history(history);
        if !history.is_empty() {
            prompt.push_str(&format!("Previous conversation:\n{history}\n"));
        }
        prompt.push_str(&format!(
            "Given the context information and not prior knowledge, answer the question: {}",
            query.trim()
        ));
        prompt
    }

    pub async fn generate(
        &self,
        query: &str,
        chunks: &[EnrichedChunk],
        history: &[ChatTurn],
    ) -> Result<GeneratedAnswer> {
        if chunks.is_empty() {
            info!("Sin contexto recuperado; se devuelve respuesta de contexto insuficiente.");
            return Ok(GeneratedAnswer {
                answer: INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
            });
        }

        let context = build_context(chunks, self.max_context_chars);
        if context.included < chunks.len() {
            info!(
                "Contexto recortado: {} de {} chunks caben en {} caracteres",
                context.included,
                chunks.len(),
                self.max_context_chars
            );
        }
        if context.included == 0 {
            return Ok(GeneratedAnswer {
                answer: INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
            });
        }

        let prompt = self.build_prompt(query, &context, history);
        let answer = with_retry("generación de respuesta", self.policy, || {
            self.model.complete(&self.preamble, &prompt)
        })
        .await
        .map_err(PipelineError::Generation)?;

        let answer = answer.trim().to_string();
        if answer.is_empty() {
            return Err(PipelineError::Generation("el modelo devolvió una respuesta vacía".into()));
        }

        Ok(GeneratedAnswer {
            answer,
            sources: context.sources,
        })
    }
}

fn build_preamble(repo: &RepoLocation) -> String {
    let (owner, name) = repo.owner_and_name();
    format!(
        "You are an AI assistant specialized in answering questions about the {owner}/{name} \
GitHub repository ({url}).
Your task is to provide accurate, helpful responses based on the repository content provided to you.

Follow these guidelines:
1. Base your answers ONLY on the provided repository content context.
2. If the provided context is insufficient to answer the question, say so. Don't make up information.
3. Include relevant GitHub file links when referencing specific code or documentation.
4. Explain technical concepts clearly, assuming the user has some technical knowledge but may not be familiar with all aspects of the repository.",
        url = repo.base_url(),
    )
}
