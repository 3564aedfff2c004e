use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// All thresholds used by the pipeline. Every component receives the section it
/// needs explicitly; nothing is read from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub extraction: ExtractionConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding_retry: RetryConfig,
    pub store_retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub ingest_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Minimum non-whitespace characters a page needs before OCR is skipped.
    pub min_page_chars: usize,
    /// Minimum share of alphanumeric characters among the non-whitespace ones.
    pub min_alnum_ratio: f32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_page_chars: 40,
            min_alnum_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1_200,
            min_chars: 180,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.min_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "min_chars must be positive".to_string(),
            ));
        }
        // Below twice the minimum a split can no longer leave both sides at min_chars.
        if self.max_chars < self.min_chars.saturating_mul(2) {
            return Err(IngestError::InvalidChunkConfig(format!(
                "max_chars {} must be at least twice min_chars {}",
                self.max_chars, self.min_chars
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_k: usize,
    pub max_k: usize,
    pub max_context_length: usize,
    pub separator: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            max_k: 50,
            max_context_length: 6_000,
            separator: "\n\n---\n\n".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry (1-based), doubling from the initial backoff.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub extraction_ms: u64,
    pub embedding_ms: u64,
    pub store_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            extraction_ms: 120_000,
            embedding_ms: 15_000,
            store_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn extraction(&self) -> Duration {
        Duration::from_millis(self.extraction_ms)
    }

    pub fn embedding(&self) -> Duration {
        Duration::from_millis(self.embedding_ms)
    }

    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, IngestError> {
        let raw = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&raw).map_err(|error| {
            IngestError::InvalidArgument(format!("config {}: {error}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        self.chunking.validate()?;
        if !(0.0..=1.0).contains(&self.extraction.min_alnum_ratio) {
            return Err(IngestError::InvalidArgument(format!(
                "min_alnum_ratio {} must be within [0, 1]",
                self.extraction.min_alnum_ratio
            )));
        }
        if self.embedding_retry.max_attempts == 0 || self.store_retry.max_attempts == 0 {
            return Err(IngestError::InvalidArgument(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retrieval.default_k == 0 || self.retrieval.max_k < self.retrieval.default_k {
            return Err(IngestError::InvalidArgument(format!(
                "retrieval k bounds are inconsistent: default {} max {}",
                self.retrieval.default_k, self.retrieval.max_k
            )));
        }
        Ok(())
    }

    pub fn concurrency(&self) -> usize {
        if self.ingest_concurrency == 0 {
            4
        } else {
            self.ingest_concurrency
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_chunk_bounds_are_rejected() {
        let config = ChunkingConfig {
            max_chars: 10,
            min_chars: 20,
        };
        assert!(matches!(
            config.validate(),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }

    #[test]
    fn max_below_twice_min_is_rejected() {
        let config = ChunkingConfig {
            max_chars: 300,
            min_chars: 180,
        };
        assert!(matches!(
            config.validate(),
            Err(IngestError::InvalidChunkConfig(_))
        ));
        assert!(ChunkingConfig {
            max_chars: 360,
            min_chars: 180,
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(300));
    }

    #[test]
    fn partial_json_keeps_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"chunking": {"max_chars": 800}}"#)?;

        let config = PipelineConfig::from_json_file(&path)?;
        assert_eq!(config.chunking.max_chars, 800);
        assert_eq!(config.chunking.min_chars, 180);
        assert_eq!(config.retrieval.default_k, 5);
        Ok(())
    }
}
