pub mod chunking;
pub mod citations;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod harness;
pub mod index_writer;
pub mod ingest;
pub mod models;
pub mod retrieval;
pub mod stores;
pub mod traits;

pub use chunking::{clean_text, Chunker};
pub use citations::assemble_citations;
pub use config::{
    ChunkingConfig, ExtractionConfig, PipelineConfig, RetrievalConfig, RetryConfig, TimeoutConfig,
};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, HttpEmbedder, RetryingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingError, ErrorKind, IngestError, RetrievalError, StoreError};
pub use extractor::{
    Density, DirectExtractor, FormatExtractor, HttpOcr, NoOcr, OcrEndpointConfig, OcrEngine,
    TesseractOcr, TextExtractor,
};
pub use harness::QueryHarness;
pub use index_writer::{DocumentGuard, IndexWriter};
pub use ingest::{
    digest_bytes, digest_file, discover_documents, generate_document_id, ChunkWarningSignal,
    IngestPipeline, TracingWarningSink, WarningSink,
};
pub use models::{
    Chunk, Citation, CitationSpan, Document, DocumentFormat, DocumentRecord, DocumentRef,
    ExtractionMethod, IndexStats, IndexedChunk, IngestOutcome, IngestStatus, Page, QueryError,
    QueryRequest, QueryResult, ScoredChunk,
};
pub use retrieval::{assemble_context, cosine_similarity, rank_order, Retriever};
pub use stores::{MemoryIndex, QdrantStore};
pub use traits::ChunkIndex;
