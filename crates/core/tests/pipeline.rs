use async_trait::async_trait;
use kb_search_core::{
    CharacterNgramEmbedder, ChunkIndex, DirectExtractor, Document, DocumentFormat, DocumentRef,
    Embedder, EmbeddingError, ErrorKind, IndexWriter, IngestError, IngestOutcome, IngestPipeline,
    MemoryIndex, OcrEngine, PipelineConfig, QueryHarness, QueryRequest, Retriever, RetryConfig,
    RetryingEmbedder, TextExtractor,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PAGE_ONE: &str = "Patient presents with abdominal pain of two hours in the epigastrium. \
Dolor abdominal de 2 horas de evolución en epigastrio, acompañado de náuseas y vómitos.";

/// Serves fixed page texts regardless of the document bytes.
struct FixedPages(Vec<&'static str>);

impl DirectExtractor for FixedPages {
    fn extract_pages(
        &self,
        _document: &Document,
    ) -> Result<Vec<Result<String, IngestError>>, IngestError> {
        Ok(self.0.iter().map(|text| Ok(text.to_string())).collect())
    }
}

/// OCR that runs but never recovers anything.
struct BlankOcr;

impl OcrEngine for BlankOcr {
    fn page_count(&self, _document: &Document) -> Result<u32, IngestError> {
        Ok(1)
    }

    fn extract_ocr(&self, _document: &Document, _page: u32) -> Result<String, IngestError> {
        Ok(String::new())
    }
}

struct UnavailableEmbedder {
    calls: AtomicU32,
}

#[async_trait]
impl Embedder for UnavailableEmbedder {
    fn dimensions(&self) -> usize {
        CharacterNgramEmbedder::default().dimensions()
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EmbeddingError::Provider {
            status: 503,
            details: "provider unavailable".to_string(),
        })
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    }
}

fn guide() -> DocumentRef {
    DocumentRef::Blob {
        source: "/kb/guia-clinica.pdf".to_string(),
        format: DocumentFormat::Pdf,
        bytes: b"%PDF-1.4 guide".to_vec(),
    }
}

struct Workspace {
    index: Arc<MemoryIndex>,
    pipeline: Arc<IngestPipeline<MemoryIndex, CharacterNgramEmbedder>>,
    harness: QueryHarness<MemoryIndex, CharacterNgramEmbedder>,
}

fn workspace(pages: Vec<&'static str>) -> Result<Workspace, IngestError> {
    let config = PipelineConfig::default();
    let index = Arc::new(MemoryIndex::new());
    let embedder = Arc::new(CharacterNgramEmbedder::default());

    let pipeline = IngestPipeline::new(
        TextExtractor::new(FixedPages(pages), BlankOcr, config.extraction.clone()),
        IndexWriter::new(
            Arc::clone(&index),
            Arc::clone(&embedder),
            fast_retry(),
            config.timeouts.store(),
        ),
        &config,
    )?;
    let harness = QueryHarness::new(Retriever::new(
        Arc::clone(&index),
        embedder,
        config.retrieval.clone(),
        fast_retry(),
        config.timeouts.store(),
    ));

    Ok(Workspace {
        index,
        pipeline: Arc::new(pipeline),
        harness,
    })
}

#[tokio::test]
async fn empty_second_page_is_flagged_and_first_page_is_not() -> Result<(), IngestError> {
    let workspace = workspace(vec![PAGE_ONE, ""])?;

    let status = workspace.pipeline.run_ingest(guide(), false).await;
    assert_eq!(status.outcome, IngestOutcome::SuccessWithWarnings);
    assert_eq!(status.warning_pages, vec![2]);

    let chunks = workspace
        .index
        .document_chunks(&status.document_id)
        .await?;
    let page_two = chunks
        .iter()
        .filter(|chunk| chunk.page_start <= 2 && chunk.page_end >= 2)
        .collect::<Vec<_>>();
    assert!(!page_two.is_empty());
    assert!(page_two.iter().all(|chunk| chunk.chunk_warning));
    assert!(chunks
        .iter()
        .filter(|chunk| chunk.page_end == 1)
        .all(|chunk| !chunk.chunk_warning));
    Ok(())
}

#[tokio::test]
async fn dense_pages_never_raise_warnings() -> Result<(), IngestError> {
    let workspace = workspace(vec![PAGE_ONE, PAGE_ONE])?;

    let status = workspace.pipeline.run_ingest(guide(), false).await;
    assert_eq!(status.outcome, IngestOutcome::Success);

    let chunks = workspace
        .index
        .document_chunks(&status.document_id)
        .await?;
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|chunk| !chunk.chunk_warning));
    Ok(())
}

#[tokio::test]
async fn spanish_query_cites_the_readable_page_only() -> Result<(), IngestError> {
    let workspace = workspace(vec![PAGE_ONE, ""])?;
    let status = workspace.pipeline.run_ingest(guide(), false).await;

    let result = workspace
        .harness
        .run_query(&QueryRequest::new(
            "Dolor abdominal 2 horas en epigastrio, náuseas",
        ))
        .await;

    assert!(result.is_ok());
    assert!(result.context_text.contains("epigastrio"));
    assert_eq!(result.citations.len(), 1);
    assert_eq!(result.citations[0].document_id, status.document_id);
    assert_eq!(result.citations[0].pages(), vec![1]);
    Ok(())
}

#[tokio::test]
async fn empty_index_answers_with_nothing() -> Result<(), IngestError> {
    let workspace = workspace(vec![PAGE_ONE])?;

    let result = workspace
        .harness
        .run_query(&QueryRequest::new("dolor abdominal"))
        .await;

    assert!(result.is_ok());
    assert!(result.context_text.is_empty());
    assert!(result.citations.is_empty());
    Ok(())
}

#[tokio::test]
async fn failing_embedding_provider_surfaces_after_three_attempts() {
    let config = PipelineConfig::default();
    let provider = Arc::new(UnavailableEmbedder {
        calls: AtomicU32::new(0),
    });
    let embedder = Arc::new(RetryingEmbedder::new(
        Arc::clone(&provider),
        fast_retry(),
        Duration::from_secs(1),
    ));
    let harness = QueryHarness::new(Retriever::new(
        Arc::new(MemoryIndex::new()),
        embedder,
        config.retrieval.clone(),
        fast_retry(),
        config.timeouts.store(),
    ));

    let result = harness
        .run_query(&QueryRequest::new("dolor abdominal"))
        .await;

    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    assert!(result.context_text.is_empty());
    assert!(result.citations.is_empty());
    let error = result.error.map(|error| error.kind);
    assert_eq!(error, Some(ErrorKind::EmbeddingFailure));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reingestion_never_empties_the_document() -> Result<(), IngestError> {
    let workspace = workspace(vec![PAGE_ONE])?;
    let first = workspace.pipeline.run_ingest(guide(), false).await;
    assert_eq!(first.outcome, IngestOutcome::Success);

    let pipeline = Arc::clone(&workspace.pipeline);
    let writer = tokio::spawn(async move {
        for _ in 0..20 {
            pipeline.run_ingest(guide(), true).await;
        }
    });

    for _ in 0..50 {
        let result = workspace
            .harness
            .run_query(&QueryRequest::new("abdominal pain"))
            .await;
        assert!(result.is_ok());
        assert_eq!(result.citations.len(), 1);
        tokio::task::yield_now().await;
    }

    writer
        .await
        .map_err(|error| IngestError::Task(error.to_string()))?;
    Ok(())
}
