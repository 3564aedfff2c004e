pub mod memory;
pub mod qdrant;

pub use memory::MemoryIndex;
pub use qdrant::QdrantStore;

use crate::config::RetryConfig;
use crate::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Runs one store call under a timeout, retrying transient failures with
/// backoff until `retry.max_attempts` calls have been made.
pub async fn call_store<T, F, Fut>(
    retry: &RetryConfig,
    timeout: Duration,
    operation: &'static str,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = tokio::time::timeout(timeout, call())
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)));

        match outcome {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < attempts => {
                warn!(operation, attempt, max_attempts = attempts, %error, "store call failed");
                tokio::time::sleep(retry.backoff(attempt)).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() -> Result<(), StoreError> {
        let calls = AtomicU32::new(0);
        let value = call_store(&fast_retry(), Duration::from_secs(1), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::NotReady("warming up".to_string()))
            } else {
                Ok(7)
            }
        })
        .await?;

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome: Result<(), _> =
            call_store(&fast_retry(), Duration::from_secs(1), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Request("bad filter".to_string()))
            })
            .await;

        assert!(matches!(outcome, Err(StoreError::Request(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let outcome: Result<(), _> = call_store(
            &RetryConfig {
                max_attempts: 1,
                ..fast_retry()
            },
            Duration::from_millis(5),
            "test",
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(outcome, Err(StoreError::Timeout(_))));
    }
}
