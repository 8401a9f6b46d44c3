//! Pasarela de embeddings: lotes ordenados, timeout, reintentos acotados y
//! validación del número de vectores devueltos.

use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::llm::Embedder;
use crate::retry::{with_retry, RetryPolicy};

#[derive(Clone)]
pub struct EmbeddingGateway {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    policy: RetryPolicy,
}

impl EmbeddingGateway {
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize, policy: RetryPolicy) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
            policy,
        }
    }

    /// Un vector por texto, en el mismo orden que la entrada.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Los lotes se procesan secuencialmente para conservar el orden.
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(texts.chunks(self.batch_size))
            .then(|batch| self.embed_batch(batch))
            .try_collect()
            .await?;

        Ok(batches.into_iter().flatten().collect())
    }

    /// Embedding de un único texto (la consulta del usuario).
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| PipelineError::Embedding("respuesta vacía para la consulta".into()))
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        debug!("Generando embeddings para un lote de {} textos", batch.len());
        let vectors = with_retry("embeddings", self.policy, || self.embedder.embed(batch))
            .await
            .map_err(PipelineError::Embedding)?;

        if vectors.len() != batch.len() {
            return Err(PipelineError::Embedding(format!(
                "se esperaban {} vectores y se recibieron {}",
                batch.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Embedder determinista: el vector depende sólo del texto.
    #[derive(Default)]
    pub(crate) struct FakeEmbedder {
        pub calls: AtomicUsize,
        pub fail: bool,
        pub drop_last: bool,
    }

    pub(crate) fn vector_for(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        for (i, b) in text.bytes().enumerate() {
            v[i % 8] += f32::from(b) / 255.0;
        }
        v[7] += 1.0;
        v
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("proveedor no disponible"));
            }
            let mut out: Vec<Vec<f32>> = texts.iter().map(|t| vector_for(t)).collect();
            if self.drop_last {
                out.pop();
            }
            Ok(out)
        }
    }

    pub(crate) fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            timeout: Duration::from_secs(2),
            base_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn preserves_order_across_batches() {
        let embedder = Arc::new(FakeEmbedder::default());
        let gateway = EmbeddingGateway::new(embedder.clone(), 2, test_policy());
        let texts: Vec<String> = (0..5).map(|i| format!("texto {i}")).collect();

        let vectors = gateway.embed(&texts).await.unwrap();

        assert_eq!(vectors.len(), 5);
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector, &vector_for(text));
        }
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn provider_failure_is_embedding_failure_after_retries() {
        let embedder = Arc::new(FakeEmbedder {
            fail: true,
            ..FakeEmbedder::default()
        });
        let gateway = EmbeddingGateway::new(embedder.clone(), 16, test_policy());

        let err = gateway.embed_query("hola").await.unwrap_err();

        assert!(matches!(err, PipelineError::Embedding(_)));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn count_mismatch_is_rejected() {
        let embedder = Arc::new(FakeEmbedder {
            drop_last: true,
            ..FakeEmbedder::default()
        });
        let gateway = EmbeddingGateway::new(embedder, 16, test_policy());
        let texts = vec!["a".to_string(), "b".to_string()];
        tokio_test::assert_err!(gateway.embed(&texts).await);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let embedder = Arc::new(FakeEmbedder::default());
        let gateway = EmbeddingGateway::new(embedder.clone(), 16, test_policy());
        assert!(gateway.embed(&[]).await.unwrap().is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }
}
