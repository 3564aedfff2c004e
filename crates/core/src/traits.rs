use crate::models::{Chunk, DocumentRecord, IndexStats, IndexedChunk, ScoredChunk};
use crate::StoreError;
use async_trait::async_trait;

/// Durable home of chunks and their embeddings.
///
/// Implementations must never expose a mix of two generations of the same
/// document to a single `search` call, and must only drop the previous
/// chunks of a document once the replacement has been written.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    async fn replace_document(
        &self,
        record: &DocumentRecord,
        entries: &[IndexedChunk],
    ) -> Result<(), StoreError>;

    /// Top `limit` non-empty chunks by cosine similarity, in rank order.
    async fn search(&self, query_vector: &[f32], limit: usize)
        -> Result<Vec<ScoredChunk>, StoreError>;

    async fn document_record(&self, document_id: &str)
        -> Result<Option<DocumentRecord>, StoreError>;

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError>;

    async fn stats(&self) -> Result<IndexStats, StoreError>;
}
