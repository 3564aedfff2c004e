use crate::models::{Chunk, DocumentRecord, IndexStats, IndexedChunk, ScoredChunk};
use crate::retrieval::{cosine_similarity, rank_order};
use crate::traits::ChunkIndex;
use crate::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    record: DocumentRecord,
    entries: Vec<IndexedChunk>,
}

#[derive(Debug, Default, Clone)]
struct Snapshot {
    documents: BTreeMap<String, Arc<StoredDocument>>,
}

/// Copy-on-write index. Every reader works on one immutable snapshot and a
/// replacement swaps a document's chunks in a single step. When opened on a
/// directory, each document lives in its own JSON file, written via temp file
/// + rename before the new version becomes visible.
pub struct MemoryIndex {
    state: RwLock<Arc<Snapshot>>,
    persist_dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// File holding one document inside an index directory.
pub(crate) fn document_file(dir: &Path, document_id: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    dir.join(format!("{:x}.json", hasher.finalize()))
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(Snapshot::default())),
            persist_dir: None,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut documents = BTreeMap::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = listing.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let document: StoredDocument = serde_json::from_slice(&bytes)?;
            documents.insert(document.record.document_id.clone(), Arc::new(document));
        }

        debug!(path = %dir.display(), documents = documents.len(), "opened index directory");

        Ok(Self {
            state: RwLock::new(Arc::new(Snapshot { documents })),
            persist_dir: Some(dir),
            write_lock: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Result<Arc<Snapshot>, StoreError> {
        self.state
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| StoreError::NotReady("index lock poisoned".to_string()))
    }

    /// Rewrites only the file of `document`; other documents are untouched.
    async fn persist(&self, document: &StoredDocument) -> Result<(), StoreError> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };

        let path = document_file(dir, &document.record.document_id);
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, serde_json::to_vec(document)?).await?;
        if let Err(error) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(error.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkIndex for MemoryIndex {
    async fn replace_document(
        &self,
        record: &DocumentRecord,
        entries: &[IndexedChunk],
    ) -> Result<(), StoreError> {
        if let Some(stray) = entries
            .iter()
            .find(|entry| entry.chunk.document_id != record.document_id)
        {
            return Err(StoreError::Request(format!(
                "chunk {} belongs to {} not {}",
                stray.chunk.chunk_id, stray.chunk.document_id, record.document_id
            )));
        }

        let replacement = Arc::new(StoredDocument {
            record: record.clone(),
            entries: entries.to_vec(),
        });

        // Disk first: a failed flush must leave the previous version in place.
        let _write = self.write_lock.lock().await;
        self.persist(&replacement).await?;

        let mut guard = self
            .state
            .write()
            .map_err(|_| StoreError::NotReady("index lock poisoned".to_string()))?;
        let mut next = Snapshot::clone(&guard);
        next.documents
            .insert(record.document_id.clone(), replacement);
        *guard = Arc::new(next);
        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let snapshot = self.snapshot()?;
        let mut scored = Vec::new();

        for document in snapshot.documents.values() {
            for entry in &document.entries {
                if entry.chunk.is_placeholder() {
                    continue;
                }
                if entry.embedding.len() != query_vector.len() {
                    return Err(StoreError::Request(format!(
                        "query vector dim {} is not {}",
                        query_vector.len(),
                        entry.embedding.len()
                    )));
                }
                scored.push(ScoredChunk {
                    chunk: entry.chunk.clone(),
                    score: cosine_similarity(query_vector, &entry.embedding),
                });
            }
        }

        scored.sort_by(rank_order);
        scored.truncate(limit);
        Ok(scored)
    }

    async fn document_record(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self
            .snapshot()?
            .documents
            .get(document_id)
            .map(|document| document.record.clone()))
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        Ok(self
            .snapshot()?
            .documents
            .get(document_id)
            .map(|document| {
                document
                    .entries
                    .iter()
                    .map(|entry| entry.chunk.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stats(&self) -> Result<IndexStats, StoreError> {
        let snapshot = self.snapshot()?;
        let chunks = snapshot
            .documents
            .values()
            .flat_map(|document| document.entries.iter());
        let (total, warnings) = chunks.fold((0, 0), |(total, warnings), entry| {
            (total + 1, warnings + usize::from(entry.chunk.chunk_warning))
        });
        Ok(IndexStats {
            documents: Some(snapshot.documents.len()),
            chunks: total,
            warning_chunks: warnings,
        })
    }
}
