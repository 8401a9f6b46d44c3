//! Reintentos acotados con backoff exponencial y timeout por intento
//! para las llamadas a servicios externos (embeddings y LLM).

use std::future::Future;
use std::time::Duration;

use tracing::warn;

const BASE_BACKOFF_MS: u64 = 500;

/// Política de reintentos: `max_retries` reintentos además del primer intento.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, timeout: Duration) -> Self {
        Self {
            max_retries,
            timeout,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
        }
    }

    /// Espera antes del reintento `attempt` (0, 1, 2...): base · 2^attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Ejecuta `f` hasta `max_retries + 1` veces. Un intento que supera el
/// timeout cuenta como fallo. Devuelve el mensaje del último error.
pub async fn with_retry<T, E, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut f: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error = String::new();
    for attempt in 0..=policy.max_retries {
        match tokio::time::timeout(policy.timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => {
                last_error = format!("timeout tras {}s", policy.timeout.as_secs_f32())
            }
        }

        if attempt < policy.max_retries {
            let delay = policy.backoff(attempt);
            warn!(
                "{label}: intento {}/{} fallido ({last_error}), reintentando en {}ms",
                attempt + 1,
                policy.max_retries + 1,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout: Duration::from_millis(200),
            base_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles_each_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", fast_policy(2), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transitorio")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry("test", fast_policy(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("caído") }
        })
        .await;
        assert_eq!(result, Err("caído".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let result: Result<(), String> = with_retry("test", fast_policy(0), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), String>(())
        })
        .await;
        assert!(result.unwrap_err().contains("timeout"));
    }
}
