use crate::config::RetryConfig;
use crate::embeddings::Embedder;
use crate::error::IngestError;
use crate::models::{Chunk, DocumentRecord, IndexedChunk};
use crate::stores::call_store;
use crate::traits::ChunkIndex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Exclusive hold on one document id. Whoever holds it may read the stored
/// version, load the source and replace the document without interleaving.
pub struct DocumentGuard {
    document_id: String,
    _held: OwnedMutexGuard<()>,
}

impl DocumentGuard {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }
}

/// Embeds a document's chunks and swaps them into the index. Work on one
/// document id is serialised through `lock_document`; distinct documents
/// proceed independently.
pub struct IndexWriter<I, E> {
    index: Arc<I>,
    embedder: Arc<E>,
    store_retry: RetryConfig,
    store_timeout: Duration,
    document_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<I, E> IndexWriter<I, E>
where
    I: ChunkIndex,
    E: Embedder,
{
    pub fn new(
        index: Arc<I>,
        embedder: Arc<E>,
        store_retry: RetryConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            index,
            embedder,
            store_retry,
            store_timeout,
            document_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> &Arc<I> {
        &self.index
    }

    /// Waits until no one else holds `document_id`.
    pub async fn lock_document(&self, document_id: &str) -> Result<DocumentGuard, IngestError> {
        let lock = {
            let mut locks = self
                .document_locks
                .lock()
                .map_err(|_| IngestError::Task("document lock table poisoned".to_string()))?;
            Arc::clone(
                locks
                    .entry(document_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        Ok(DocumentGuard {
            document_id: document_id.to_string(),
            _held: lock.lock_owned().await,
        })
    }

    /// Bookkeeping of the currently indexed version, if any.
    pub async fn stored_record(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, IngestError> {
        Ok(
            call_store(&self.store_retry, self.store_timeout, "document_record", || {
                self.index.document_record(document_id)
            })
            .await?,
        )
    }

    /// Embeds every chunk first and only then replaces the document, so a
    /// failed embedding leaves the previous version searchable.
    pub async fn write_document(
        &self,
        guard: &DocumentGuard,
        record: &DocumentRecord,
        chunks: Vec<Chunk>,
    ) -> Result<usize, IngestError> {
        if guard.document_id != record.document_id {
            return Err(IngestError::InvalidArgument(format!(
                "guard for {} cannot write document {}",
                guard.document_id, record.document_id
            )));
        }
        if let Some(stray) = chunks
            .iter()
            .find(|chunk| chunk.document_id != record.document_id)
        {
            return Err(IngestError::InvalidArgument(format!(
                "chunk {} does not belong to document {}",
                stray.chunk_id, record.document_id
            )));
        }

        let dimensions = self.embedder.dimensions();
        let mut entries = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let embedding = if chunk.is_placeholder() {
                vec![0.0; dimensions]
            } else {
                self.embedder.embed(&chunk.text).await?
            };
            entries.push(IndexedChunk { chunk, embedding });
        }

        call_store(&self.store_retry, self.store_timeout, "replace_document", || {
            self.index.replace_document(record, &entries)
        })
        .await?;

        debug!(
            document_id = %record.document_id,
            chunks = entries.len(),
            "document replaced in index"
        );
        Ok(entries.len())
    }
}
