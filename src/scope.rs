//! Clasificador de ámbito: decide si una consulta trata sobre el repositorio.
//!
//! Una única llamada al LLM con instrucciones fijas. La respuesta se parsea de
//! forma estricta; si no es inequívoca se considera fuera de ámbito.

use std::sync::Arc;

use tracing::{info, warn};

use crate::enricher::RepoLocation;
use crate::error::{PipelineError, Result};
use crate::llm::ChatModel;
use crate::retry::{with_retry, RetryPolicy};

const IN_SCOPE: &str = "IN_SCOPE";
const OUT_OF_SCOPE: &str = "OUT_OF_SCOPE";

/// Descripción por defecto del dominio del repositorio (Vanna.AI).
pub const DEFAULT_DOMAIN: &str = "\
- Natural language to SQL generation
- Database querying using natural language
- SQL-related machine learning models
- Data visualization
- Python-based data analysis tools";

/// Veredicto parseado del modelo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeVerdict {
    InScope,
    OutOfScope,
    /// Respuesta no interpretable; se trata como fuera de ámbito.
    Ambiguous,
}

impl ScopeVerdict {
    pub fn is_in_scope(self) -> bool {
        self == ScopeVerdict::InScope
    }
}

/// Parseo estricto: sólo `IN_SCOPE` u `OUT_OF_SCOPE` (ignorando mayúsculas,
/// espacios, comillas, backticks y puntuación final).
pub fn parse_verdict(response: &str) -> ScopeVerdict {
    let cleaned = response
        .trim()
        .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | '.' | '!') || c.is_whitespace())
        .to_uppercase()
        .replace([' ', '-'], "_");

    match cleaned.as_str() {
        IN_SCOPE => ScopeVerdict::InScope,
        OUT_OF_SCOPE => ScopeVerdict::OutOfScope,
        _ => ScopeVerdict::Ambiguous,
    }
}

pub struct ScopeClassifier {
    model: Arc<dyn ChatModel>,
    preamble: String,
    policy: RetryPolicy,
}

impl ScopeClassifier {
    pub fn new(model: Arc<dyn ChatModel>, repo: &RepoLocation, domain: &str, policy: RetryPolicy) -> Self {
        Self {
            model,
            preamble: build_preamble(repo, domain),
            policy,
        }
    }

    /// Mensaje de usuario enviado al modelo para una consulta.
    pub fn prompt_for(query: &str) -> String {
        format!("Query: {}", query.trim())
    }

    /// Clasifica la consulta. Los errores de transporte (tras los reintentos)
    /// son `Classification`; una respuesta ambigua no es un error.
    pub async fn classify(&self, query: &str) -> Result<ScopeVerdict> {
        let prompt = Self::prompt_for(query);
        let response = with_retry("clasificación de ámbito", self.policy, || {
            self.model.complete(&self.preamble, &prompt)
        })
        .await
        .map_err(PipelineError::Classification)?;

        let verdict = parse_verdict(&response);
        match verdict {
            ScopeVerdict::Ambiguous => warn!(
                "Respuesta de clasificación ambigua, se asume fuera de ámbito: {:?}",
                response
            ),
            _ => info!("Consulta clasificada como {:?}", verdict),
        }
        Ok(verdict)
    }
}

fn build_preamble(repo: &RepoLocation, domain: &str) -> String {
    let (owner, name) = repo.owner_and_name();
    format!(
        "You are an AI evaluator. Your task is to determine if a given query is related to the \
{owner}/{name} GitHub repository ({url}).

The repository is focused on:
{domain}

Classification Instructions:
- If the query is related to the repository, its functionality, code, usage, or implementation, respond with \"{IN_SCOPE}\".
- If the query is about general programming, databases, SQL, or related topics that might be addressed using knowledge from the repository, respond with \"{IN_SCOPE}\".
- If the query is completely unrelated to the repository or software development in general, respond with \"{OUT_OF_SCOPE}\".

Your response must be ONLY \"{IN_SCOPE}\" or \"{OUT_OF_SCOPE}\" with no additional text.",
        url = repo.base_url(),
    )
}
