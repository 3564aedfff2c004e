use crate::config::RetryConfig;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Ingestion and retrieval must share one implementation so vectors live in
/// the same space.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[async_trait]
impl<E: Embedder + ?Sized> Embedder for std::sync::Arc<E> {
    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed(text).await
    }
}

/// Hashed character-trigram vectors, L2-normalised. Needs no provider.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

/// OpenAI-compatible `POST {endpoint}/embeddings` provider.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            dimensions,
        }
    }

    fn url(&self) -> String {
        format!("{}/embeddings", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut request = self
            .client
            .post(self.url())
            .json(&json!({ "model": self.model, "input": [text] }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Provider {
                status: status.as_u16(),
                details,
            });
        }

        let payload: Value = response.json().await?;
        let vector = parse_embedding_response(&payload)?;
        if vector.len() != self.dimensions {
            return Err(EmbeddingError::Dimension {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

fn parse_embedding_response(payload: &Value) -> Result<Vec<f32>, EmbeddingError> {
    let values = payload
        .pointer("/data/0/embedding")
        .and_then(Value::as_array)
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data[0].embedding".to_string()))?;

    values
        .iter()
        .map(|value| {
            value
                .as_f64()
                .map(|number| number as f32)
                .ok_or_else(|| EmbeddingError::InvalidResponse("non-numeric embedding value".to_string()))
        })
        .collect()
}

/// Bounds every call with a timeout and retries retryable failures with
/// exponential backoff, up to `max_attempts` calls in total.
pub struct RetryingEmbedder<E> {
    inner: E,
    config: RetryConfig,
    attempt_timeout: Duration,
}

impl<E: Embedder> RetryingEmbedder<E> {
    pub fn new(inner: E, config: RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            inner,
            config,
            attempt_timeout,
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: Embedder> Embedder for RetryingEmbedder<E> {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }

            let outcome = tokio::time::timeout(self.attempt_timeout, self.inner.embed(text))
                .await
                .unwrap_or(Err(EmbeddingError::Timeout(self.attempt_timeout)));

            match outcome {
                Ok(vector) => return Ok(vector),
                Err(error) if error.is_retryable() => {
                    warn!(attempt, max_attempts = attempts, %error, "embedding attempt failed");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(match last_error {
            Some(EmbeddingError::Timeout(elapsed)) => EmbeddingError::Timeout(elapsed),
            Some(error) => EmbeddingError::Exhausted {
                attempts,
                last: error.to_string(),
            },
            None => EmbeddingError::Exhausted {
                attempts,
                last: "no attempt was made".to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyEmbedder {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(EmbeddingError::Provider {
                    status: 503,
                    details: "unavailable".to_string(),
                })
            } else {
                Ok(vec![1.0, 0.0, 0.0, 0.0])
            }
        }
    }

    fn fast_retries() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_sync("Hydraulic pressure and flow");
        let second = embedder.embed_sync("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed_sync("abc");
        assert_eq!(vector.len(), 32);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let embedder = RetryingEmbedder::new(
            FlakyEmbedder {
                failures: 2,
                calls: calls.clone(),
            },
            fast_retries(),
            Duration::from_secs(1),
        );
        let vector = embedder.embed("query").await.expect("third attempt succeeds");
        assert_eq!(vector.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let embedder = RetryingEmbedder::new(
            FlakyEmbedder {
                failures: 10,
                calls: calls.clone(),
            },
            fast_retries(),
            Duration::from_secs(1),
        );
        let error = embedder.embed("query").await.expect_err("all attempts fail");
        assert!(matches!(error, EmbeddingError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn parses_openai_style_payload() {
        let payload = json!({ "data": [{ "embedding": [0.5, -0.25] }] });
        let vector = parse_embedding_response(&payload).expect("payload is well formed");
        assert_eq!(vector, vec![0.5, -0.25]);
    }
}
