use chrono::Utc;
use clap::{Parser, Subcommand};
use kb_search_core::{
    generate_document_id, CharacterNgramEmbedder, ChunkIndex, DocumentRef, Embedder,
    FormatExtractor, HttpEmbedder, HttpOcr, IndexWriter, IngestOutcome, IngestPipeline,
    IngestStatus, MemoryIndex, NoOcr, OcrEndpointConfig, PipelineConfig, QdrantStore,
    QueryHarness, QueryRequest, Retriever, RetryingEmbedder, TesseractOcr, TextExtractor,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kbs", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON file overriding pipeline defaults
    #[arg(long, env = "KB_CONFIG")]
    config: Option<PathBuf>,

    /// Local index directory, used when no Qdrant URL is given
    #[arg(long, env = "KB_INDEX_PATH", default_value = "kb-index")]
    index_path: PathBuf,

    /// Qdrant base URL; switches the index to Qdrant
    #[arg(long, env = "KB_QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Qdrant collection
    #[arg(long, env = "KB_QDRANT_COLLECTION", default_value = "kb_chunks")]
    qdrant_collection: String,

    /// Qdrant API key
    #[arg(long, env = "KB_QDRANT_API_KEY", hide_env_values = true)]
    qdrant_api_key: Option<String>,

    /// OpenAI-compatible embeddings base URL; the local n-gram embedder is used otherwise
    #[arg(long, env = "KB_EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    /// Embeddings API key
    #[arg(long, env = "KB_EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Embedding model name
    #[arg(long, env = "KB_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Embedding vector length returned by the provider
    #[arg(long, env = "KB_EMBEDDING_DIMENSIONS", default_value = "1536")]
    embedding_dimensions: usize,

    /// Multimodal OCR endpoint used for thin pages
    #[arg(long, env = "LLM_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    /// OCR endpoint API key
    #[arg(long, env = "LLM_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,

    /// Use local pdftoppm + tesseract for thin pages
    #[arg(long, default_value_t = false)]
    tesseract: bool,

    /// Tesseract language list
    #[arg(long, default_value = "spa+eng")]
    ocr_languages: String,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a document or every supported document under a folder.
    Ingest {
        /// File or folder (searched recursively).
        #[arg(long)]
        path: PathBuf,
        /// Re-ingest even when the source checksum is unchanged.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Print one JSON status per document.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Retrieve context and citations for a query.
    Query {
        #[arg(long)]
        query: String,
        /// Number of chunks to retrieve.
        #[arg(long)]
        k: Option<usize>,
        /// Context budget in characters.
        #[arg(long)]
        max_context_length: Option<usize>,
        /// Print the full QueryResult as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show index statistics, or the stored chunks of one source.
    Inspect {
        /// Source path as it was ingested.
        #[arg(long)]
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "kbs boot"
    );

    match &cli.embedding_endpoint {
        Some(endpoint) => {
            let embedder = Arc::new(RetryingEmbedder::new(
                HttpEmbedder::new(
                    endpoint.clone(),
                    cli.embedding_api_key.clone(),
                    cli.embedding_model.clone(),
                    cli.embedding_dimensions,
                ),
                config.embedding_retry.clone(),
                config.timeouts.embedding(),
            ));
            with_index(&cli, config, embedder).await
        }
        None => with_index(&cli, config, Arc::new(CharacterNgramEmbedder::default())).await,
    }
}

async fn with_index<E>(cli: &Cli, config: PipelineConfig, embedder: Arc<E>) -> anyhow::Result<()>
where
    E: Embedder + 'static,
{
    match &cli.qdrant_url {
        Some(url) => {
            let store = QdrantStore::new(
                url,
                cli.qdrant_collection.clone(),
                cli.qdrant_api_key.clone(),
                embedder.dimensions(),
            )?;
            store.ensure_collection().await?;
            run(cli, config, Arc::new(store), embedder).await
        }
        None => {
            let index = MemoryIndex::open(&cli.index_path).await?;
            run(cli, config, Arc::new(index), embedder).await
        }
    }
}

fn build_extractor(cli: &Cli, config: &PipelineConfig) -> TextExtractor {
    let extraction = config.extraction.clone();
    if let Some(endpoint) = &cli.ocr_endpoint {
        return TextExtractor::new(
            FormatExtractor,
            HttpOcr::new(OcrEndpointConfig {
                endpoint: endpoint.clone(),
                api_key: cli.ocr_api_key.clone(),
            }),
            extraction,
        );
    }
    if cli.tesseract {
        return TextExtractor::new(
            FormatExtractor,
            TesseractOcr {
                languages: cli.ocr_languages.clone(),
                ..TesseractOcr::default()
            },
            extraction,
        );
    }
    TextExtractor::new(FormatExtractor, NoOcr, extraction)
}

async fn run<I, E>(
    cli: &Cli,
    config: PipelineConfig,
    index: Arc<I>,
    embedder: Arc<E>,
) -> anyhow::Result<()>
where
    I: ChunkIndex + 'static,
    E: Embedder + 'static,
{
    match &cli.command {
        Command::Ingest { path, force, json } => {
            let writer = IndexWriter::new(
                Arc::clone(&index),
                embedder,
                config.store_retry.clone(),
                config.timeouts.store(),
            );
            let pipeline = Arc::new(IngestPipeline::new(
                build_extractor(cli, &config),
                writer,
                &config,
            )?);

            let statuses = if path.is_dir() {
                pipeline.ingest_folder(path, *force).await?
            } else {
                vec![pipeline.run_ingest(DocumentRef::Path(path.clone()), *force).await]
            };

            for status in &statuses {
                if *json {
                    println!("{}", serde_json::to_string(status)?);
                } else {
                    print_status(status);
                }
            }

            let failed = statuses
                .iter()
                .filter(|status| status.outcome == IngestOutcome::Failed)
                .count();
            if failed > 0 {
                warn!(failed, total = statuses.len(), "some documents failed to ingest");
            }
            println!(
                "{} document(s) processed, {} failed, at {}",
                statuses.len(),
                failed,
                Utc::now().to_rfc3339()
            );
        }
        Command::Query {
            query,
            k,
            max_context_length,
            json,
        } => {
            let harness = QueryHarness::new(Retriever::new(
                index,
                embedder,
                config.retrieval.clone(),
                config.store_retry.clone(),
                config.timeouts.store(),
            ));
            let request = QueryRequest {
                query: query.clone(),
                k: *k,
                max_context_length: *max_context_length,
            };

            let result = harness
                .run_query_until(&request, async {
                    if tokio::signal::ctrl_c().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                })
                .await;

            if *json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if let Some(error) = &result.error {
                println!(
                    "error: kind={:?} retryable={} {}",
                    error.kind, error.retryable, error.message
                );
            } else {
                println!("{}", result.context_text);
                for citation in &result.citations {
                    let pages = citation
                        .pages()
                        .iter()
                        .map(|page| page.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    println!(
                        "cite: document_id={} source={} pages={} spans={}",
                        citation.document_id,
                        citation.source,
                        pages,
                        citation.spans.len()
                    );
                }
            }
        }
        Command::Inspect { source } => match source {
            Some(source) => {
                let document_id = generate_document_id(source);
                match index.document_record(&document_id).await? {
                    Some(record) => {
                        println!("{}", serde_json::to_string_pretty(&record)?);
                        for chunk in index.document_chunks(&document_id).await? {
                            println!(
                                "chunk={} seq={} pages={}-{} chars={}..{} warning={}",
                                chunk.chunk_id,
                                chunk.sequence_index,
                                chunk.page_start,
                                chunk.page_end,
                                chunk.char_start,
                                chunk.char_end,
                                chunk.chunk_warning
                            );
                        }
                    }
                    None => println!("{source} is not indexed"),
                }
            }
            None => {
                println!("{}", serde_json::to_string_pretty(&index.stats().await?)?);
            }
        },
    }

    Ok(())
}

fn print_status(status: &IngestStatus) {
    match &status.error {
        Some(error) => println!("[{:?}] {} error={}", status.outcome, status.source, error),
        None => println!(
            "[{:?}] {} pages={} chunks={} warning_pages={:?} ocr={}",
            status.outcome,
            status.source,
            status.page_count,
            status.chunk_count,
            status.warning_pages,
            status.used_ocr
        ),
    }
    for (page, errors) in &status.extraction_errors {
        println!("  page {page}: {}", errors.join("; "));
    }
}
