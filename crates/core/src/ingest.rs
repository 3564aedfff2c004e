use crate::chunking::Chunker;
use crate::config::PipelineConfig;
use crate::embeddings::Embedder;
use crate::error::{ErrorKind, IngestError};
use crate::extractor::TextExtractor;
use crate::index_writer::IndexWriter;
use crate::models::{
    Chunk, Document, DocumentFormat, DocumentRecord, DocumentRef, ExtractionMethod, IngestOutcome,
    IngestStatus, Page,
};
use crate::traits::ChunkIndex;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Recursively lists every file whose extension maps to a `DocumentFormat`.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(DocumentFormat::from_extension)
            .is_some();

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    Ok(digest_bytes(&bytes))
}

/// Stable id derived from the source location, so re-ingesting a source
/// supersedes its previous version.
pub fn generate_document_id(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Raised once per degraded page of an ingested document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWarningSignal {
    pub document_id: String,
    pub source: String,
    pub page: u32,
    pub chunk_ids: Vec<String>,
}

/// Monitoring hook for pages whose extraction came back incomplete.
pub trait WarningSink: Send + Sync {
    fn chunk_warning(&self, signal: &ChunkWarningSignal);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWarningSink;

impl WarningSink for TracingWarningSink {
    fn chunk_warning(&self, signal: &ChunkWarningSignal) {
        warn!(
            document_id = %signal.document_id,
            source = %signal.source,
            page = signal.page,
            chunks = signal.chunk_ids.len(),
            "page extracted with degraded quality"
        );
    }
}

/// Extract, chunk and index one document at a time, reporting a status per
/// document instead of failing the batch.
pub struct IngestPipeline<I, E> {
    extractor: Arc<TextExtractor>,
    chunker: Chunker,
    writer: IndexWriter<I, E>,
    warnings: Arc<dyn WarningSink>,
    extraction_timeout: Duration,
    concurrency: usize,
}

impl<I, E> IngestPipeline<I, E>
where
    I: ChunkIndex + 'static,
    E: Embedder + 'static,
{
    pub fn new(
        extractor: TextExtractor,
        writer: IndexWriter<I, E>,
        config: &PipelineConfig,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            extractor: Arc::new(extractor),
            chunker: Chunker::new(config.chunking)?,
            writer,
            warnings: Arc::new(TracingWarningSink),
            extraction_timeout: config.timeouts.extraction(),
            concurrency: config.concurrency(),
        })
    }

    pub fn with_warning_sink(mut self, warnings: Arc<dyn WarningSink>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn writer(&self) -> &IndexWriter<I, E> {
        &self.writer
    }

    pub async fn run_ingest(&self, document: DocumentRef, force: bool) -> IngestStatus {
        let source = document.source();
        let document_id = generate_document_id(&source);

        match self.ingest(&document_id, &source, document, force).await {
            Ok(status) => status,
            Err(error) => {
                warn!(%document_id, %source, %error, "document ingestion failed");
                IngestStatus::failed(document_id, source, ErrorKind::from(&error), error.to_string())
            }
        }
    }

    /// Ingests every supported file below `folder`, `concurrency` at a time.
    /// Statuses come back in discovery order.
    pub async fn ingest_folder(
        self: &Arc<Self>,
        folder: &Path,
        force: bool,
    ) -> Result<Vec<IngestStatus>, IngestError> {
        let files = discover_documents(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported documents found in {}",
                folder.display()
            )));
        }

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(files.len());
        for path in files {
            let pipeline = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let source = path.to_string_lossy().to_string();
            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|error| IngestError::Task(error.to_string()))?;
                Ok::<_, IngestError>(pipeline.run_ingest(DocumentRef::Path(path), force).await)
            });
            handles.push((source, handle));
        }

        let mut statuses = Vec::with_capacity(handles.len());
        for (source, handle) in handles {
            let status = match handle.await {
                Ok(Ok(status)) => status,
                Ok(Err(error)) => IngestStatus::failed(
                    generate_document_id(&source),
                    source,
                    ErrorKind::from(&error),
                    error.to_string(),
                ),
                Err(error) => IngestStatus::failed(
                    generate_document_id(&source),
                    source,
                    ErrorKind::ExtractionFailure,
                    error.to_string(),
                ),
            };
            statuses.push(status);
        }

        Ok(statuses)
    }

    async fn ingest(
        &self,
        document_id: &str,
        source: &str,
        document: DocumentRef,
        force: bool,
    ) -> Result<IngestStatus, IngestError> {
        // Held from the read of the source until the index swap, so an older
        // read can never land after a newer one.
        let guard = self.writer.lock_document(document_id).await?;
        let (format, bytes) = load(document).await?;
        let checksum = digest_bytes(&bytes);

        if !force {
            if let Some(record) = self.writer.stored_record(document_id).await? {
                if record.checksum == checksum {
                    info!(%document_id, %source, "source unchanged, skipping");
                    return Ok(IngestStatus {
                        document_id: document_id.to_string(),
                        source: source.to_string(),
                        outcome: IngestOutcome::Unchanged,
                        page_count: record.page_count,
                        chunk_count: 0,
                        warning_pages: record.warning_pages,
                        used_ocr: false,
                        extraction_errors: BTreeMap::new(),
                        error: None,
                        error_kind: None,
                        finished_at: Utc::now(),
                    });
                }
            }
        }

        let document = Document {
            document_id: document_id.to_string(),
            source: source.to_string(),
            format,
            checksum: checksum.clone(),
            bytes,
            loaded_at: Utc::now(),
        };
        let pages = self.extract(document).await?;
        let chunks = self.chunker.chunk(document_id, source, &pages);

        let warning_pages = pages
            .iter()
            .filter(|page| page.degraded)
            .map(|page| page.number)
            .collect::<Vec<_>>();
        let extraction_errors = pages
            .iter()
            .filter(|page| !page.extraction_errors.is_empty())
            .map(|page| (page.number, page.extraction_errors.clone()))
            .collect::<BTreeMap<_, _>>();
        self.signal_warnings(document_id, source, &warning_pages, &chunks);

        let record = DocumentRecord {
            document_id: document_id.to_string(),
            source: source.to_string(),
            checksum,
            ingested_at: Utc::now(),
            page_count: pages.len(),
            warning_pages: warning_pages.clone(),
        };
        let chunk_count = self.writer.write_document(&guard, &record, chunks).await?;
        let used_ocr = pages.iter().any(|page| page.method == ExtractionMethod::Ocr);

        let outcome = if warning_pages.is_empty() {
            IngestOutcome::Success
        } else {
            IngestOutcome::SuccessWithWarnings
        };
        info!(
            %document_id,
            %source,
            pages = pages.len(),
            chunks = chunk_count,
            warning_pages = warning_pages.len(),
            pages_with_errors = extraction_errors.len(),
            used_ocr,
            "document ingested"
        );

        Ok(IngestStatus {
            document_id: document_id.to_string(),
            source: source.to_string(),
            outcome,
            page_count: pages.len(),
            chunk_count,
            warning_pages,
            used_ocr,
            extraction_errors,
            error: None,
            error_kind: None,
            finished_at: Utc::now(),
        })
    }

    /// OCR engines block, so extraction runs off the async workers. The timeout
    /// stops waiting; it cannot interrupt the blocking thread itself.
    async fn extract(&self, document: Document) -> Result<Vec<Page>, IngestError> {
        let extractor = Arc::clone(&self.extractor);
        let task = tokio::task::spawn_blocking(move || extractor.extract(&document));

        match tokio::time::timeout(self.extraction_timeout, task).await {
            Ok(Ok(pages)) => Ok(pages),
            Ok(Err(error)) => Err(IngestError::Task(error.to_string())),
            Err(_) => Err(IngestError::Timeout(self.extraction_timeout)),
        }
    }

    fn signal_warnings(&self, document_id: &str, source: &str, pages: &[u32], chunks: &[Chunk]) {
        for &page in pages {
            let chunk_ids = chunks
                .iter()
                .filter(|chunk| {
                    chunk.chunk_warning && chunk.page_start <= page && page <= chunk.page_end
                })
                .map(|chunk| chunk.chunk_id.clone())
                .collect();
            self.warnings.chunk_warning(&ChunkWarningSignal {
                document_id: document_id.to_string(),
                source: source.to_string(),
                page,
                chunk_ids,
            });
        }
    }
}

async fn load(document: DocumentRef) -> Result<(DocumentFormat, Vec<u8>), IngestError> {
    match document {
        DocumentRef::Blob { format, bytes, .. } => Ok((format, bytes)),
        DocumentRef::Path(path) => {
            path.file_name().ok_or_else(|| {
                IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
            })?;
            let format = path
                .extension()
                .and_then(|ext| ext.to_str())
                .and_then(DocumentFormat::from_extension)
                .ok_or_else(|| IngestError::UnsupportedFormat(path.display().to_string()))?;
            let bytes = tokio::fs::read(&path).await?;
            Ok((format, bytes))
        }
    }
}
