use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Text,
}

impl DocumentFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "txt" | "md" => Some(DocumentFormat::Text),
            _ => None,
        }
    }
}

/// A source document as handed to the pipeline. Never mutated after
/// construction; a re-ingestion builds a new value with the same id.
#[derive(Debug, Clone)]
pub struct Document {
    pub document_id: String,
    pub source: String,
    pub format: DocumentFormat,
    pub checksum: String,
    pub bytes: Vec<u8>,
    pub loaded_at: DateTime<Utc>,
}

/// Where the ingestion trigger points us.
#[derive(Debug, Clone)]
pub enum DocumentRef {
    Path(PathBuf),
    Blob {
        source: String,
        format: DocumentFormat,
        bytes: Vec<u8>,
    },
}

impl DocumentRef {
    pub fn source(&self) -> String {
        match self {
            DocumentRef::Path(path) => path.to_string_lossy().to_string(),
            DocumentRef::Blob { source, .. } => source.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Direct,
    Ocr,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page {
    pub number: u32,
    pub text: String,
    pub method: ExtractionMethod,
    /// Empty or below the density threshold after every path was tried.
    pub degraded: bool,
    /// Why the direct or OCR path produced nothing for this page.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extraction_errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source: String,
    pub sequence_index: u64,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
    pub page_start: u32,
    pub page_end: u32,
    pub chunk_warning: bool,
}

impl Chunk {
    pub fn is_placeholder(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A chunk together with its embedding, as persisted by an index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Per-document bookkeeping kept next to the chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRecord {
    pub document_id: String,
    pub source: String,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
    pub page_count: usize,
    pub warning_pages: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub documents: Option<usize>,
    pub chunks: usize,
    pub warning_chunks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<usize>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            k: None,
            max_context_length: None,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_max_context_length(mut self, max_context_length: usize) -> Self {
        self.max_context_length = Some(max_context_length);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CitationSpan {
    pub chunk_id: String,
    pub sequence_index: u64,
    pub page_start: u32,
    pub page_end: u32,
    pub char_start: usize,
    pub char_end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub document_id: String,
    pub source: String,
    pub spans: Vec<CitationSpan>,
}

impl Citation {
    pub fn pages(&self) -> Vec<u32> {
        let mut pages = self
            .spans
            .iter()
            .flat_map(|span| span.page_start..=span.page_end)
            .collect::<Vec<_>>();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub context_text: String,
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
}

impl QueryResult {
    pub fn failed(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            context_text: String::new(),
            citations: Vec::new(),
            error: Some(QueryError {
                kind,
                message: message.into(),
                retryable,
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Success,
    SuccessWithWarnings,
    Failed,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestStatus {
    pub document_id: String,
    pub source: String,
    pub outcome: IngestOutcome,
    pub page_count: usize,
    pub chunk_count: usize,
    pub warning_pages: Vec<u32>,
    pub used_ocr: bool,
    /// Per-page extraction failures, keyed by page number.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extraction_errors: BTreeMap<u32, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub finished_at: DateTime<Utc>,
}

impl IngestStatus {
    pub fn failed(
        document_id: impl Into<String>,
        source: impl Into<String>,
        kind: ErrorKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            source: source.into(),
            outcome: IngestOutcome::Failed,
            page_count: 0,
            chunk_count: 0,
            warning_pages: Vec::new(),
            used_ocr: false,
            extraction_errors: BTreeMap::new(),
            error: Some(error.into()),
            error_kind: Some(kind),
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection_is_case_insensitive() {
        assert_eq!(DocumentFormat::from_extension("PDF"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_extension("md"), Some(DocumentFormat::Text));
        assert_eq!(DocumentFormat::from_extension("rtf"), None);
    }

    #[test]
    fn citation_pages_are_sorted_and_unique() {
        let citation = Citation {
            document_id: "doc".to_string(),
            source: "guide.pdf".to_string(),
            spans: vec![
                CitationSpan {
                    chunk_id: "b".to_string(),
                    sequence_index: 1,
                    page_start: 2,
                    page_end: 3,
                    char_start: 10,
                    char_end: 20,
                },
                CitationSpan {
                    chunk_id: "a".to_string(),
                    sequence_index: 0,
                    page_start: 1,
                    page_end: 2,
                    char_start: 0,
                    char_end: 10,
                },
            ],
        };
        assert_eq!(citation.pages(), vec![1, 2, 3]);
    }

    #[test]
    fn failed_result_has_no_context() {
        let result = QueryResult::failed(ErrorKind::StoreUnavailable, "down", true);
        assert!(result.context_text.is_empty());
        assert!(result.citations.is_empty());
        assert!(!result.is_ok());
    }
}
