use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("docx parse error: {0}")]
    DocxParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ocr failed: {0}")]
    OcrFailed(String),

    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("extraction task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Timeout(_) => true,
            IngestError::Embedding(error) => error.is_retryable(),
            IngestError::Store(error) => error.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider returned {status}: {details}")]
    Provider { status: u16, details: String },

    #[error("embedding http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding response was malformed: {0}")]
    InvalidResponse(String),

    #[error("embedding dimension {actual} does not match expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl EmbeddingError {
    /// Rate limiting, server errors, transport errors and timeouts may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::Provider { status, .. } => *status == 429 || *status >= 500,
            EmbeddingError::Http(_) | EmbeddingError::Timeout(_) => true,
            EmbeddingError::Exhausted { .. } => true,
            EmbeddingError::InvalidResponse(_) | EmbeddingError::Dimension { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store request rejected: {0}")]
    Request(String),

    #[error("store not available yet: {0}")]
    NotReady(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(_)
            | StoreError::NotReady(_)
            | StoreError::Timeout(_)
            | StoreError::Io(_) => true,
            StoreError::BackendResponse { details, .. } => details.starts_with('5'),
            StoreError::Url(_) | StoreError::Serialization(_) | StoreError::Request(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid query request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetrievalError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RetrievalError::Embedding(error) => ErrorKind::from(error),
            RetrievalError::Store(error) => ErrorKind::from(error),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RetrievalError::InvalidRequest(_) => false,
            RetrievalError::Embedding(error) => error.is_retryable(),
            RetrievalError::Store(error) => error.is_transient(),
        }
    }
}

/// Failure classes surfaced to query and ingestion callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ExtractionFailure,
    EmbeddingFailure,
    StoreUnavailable,
    Timeout,
    InvalidRequest,
    Cancelled,
}

impl From<&EmbeddingError> for ErrorKind {
    fn from(value: &EmbeddingError) -> Self {
        match value {
            EmbeddingError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::EmbeddingFailure,
        }
    }
}

impl From<&IngestError> for ErrorKind {
    fn from(value: &IngestError) -> Self {
        match value {
            IngestError::Timeout(_) => ErrorKind::Timeout,
            IngestError::Embedding(error) => ErrorKind::from(error),
            IngestError::Store(error) => ErrorKind::from(error),
            IngestError::InvalidArgument(_)
            | IngestError::InvalidChunkConfig(_)
            | IngestError::UnsupportedFormat(_)
            | IngestError::MissingFileName(_) => ErrorKind::InvalidRequest,
            _ => ErrorKind::ExtractionFailure,
        }
    }
}

impl From<&StoreError> for ErrorKind {
    fn from(value: &StoreError) -> Self {
        match value {
            StoreError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::StoreUnavailable,
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        let limited = EmbeddingError::Provider {
            status: 429,
            details: "slow down".to_string(),
        };
        let bad_request = EmbeddingError::Provider {
            status: 400,
            details: "bad input".to_string(),
        };
        assert!(limited.is_retryable());
        assert!(!bad_request.is_retryable());
    }

    #[test]
    fn timeouts_map_to_timeout_kind() {
        let error = StoreError::Timeout(Duration::from_secs(1));
        assert_eq!(ErrorKind::from(&error), ErrorKind::Timeout);
        assert!(IngestError::from(error).is_retryable());
    }
}
