use crate::config::{RetrievalConfig, RetryConfig};
use crate::embeddings::Embedder;
use crate::error::RetrievalError;
use crate::models::ScoredChunk;
use crate::stores::call_store;
use crate::traits::ChunkIndex;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cosine similarity; zero when the vectors differ in length or either is all zeros.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let (dot, left_norm, right_norm) = left.iter().zip(right).fold(
        (0.0f32, 0.0f32, 0.0f32),
        |(dot, left_norm, right_norm), (a, b)| (dot + a * b, left_norm + a * a, right_norm + b * b),
    );

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Higher score first, then lower sequence index, document id and chunk id.
pub fn rank_order(left: &ScoredChunk, right: &ScoredChunk) -> Ordering {
    right
        .score
        .total_cmp(&left.score)
        .then_with(|| left.chunk.sequence_index.cmp(&right.chunk.sequence_index))
        .then_with(|| left.chunk.document_id.cmp(&right.chunk.document_id))
        .then_with(|| left.chunk.chunk_id.cmp(&right.chunk.chunk_id))
}

/// Joins chunk texts in rank order until the next one would push the context
/// past `max_chars` characters. Returns the context and the chunks it holds.
pub fn assemble_context(
    ranked: Vec<ScoredChunk>,
    separator: &str,
    max_chars: usize,
) -> (String, Vec<ScoredChunk>) {
    let separator_chars = separator.chars().count();
    let mut context = String::new();
    let mut used_chars = 0usize;
    let mut used = Vec::new();

    for hit in ranked {
        let text_chars = hit.chunk.text.chars().count();
        let needed = if used.is_empty() {
            text_chars
        } else {
            separator_chars + text_chars
        };
        if used_chars + needed > max_chars {
            break;
        }

        if !used.is_empty() {
            context.push_str(separator);
        }
        context.push_str(&hit.chunk.text);
        used_chars += needed;
        used.push(hit);
    }

    (context, used)
}

pub struct Retriever<I, E> {
    index: Arc<I>,
    embedder: Arc<E>,
    config: RetrievalConfig,
    store_retry: RetryConfig,
    store_timeout: Duration,
}

impl<I, E> Retriever<I, E>
where
    I: ChunkIndex,
    E: Embedder,
{
    pub fn new(
        index: Arc<I>,
        embedder: Arc<E>,
        config: RetrievalConfig,
        store_retry: RetryConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            index,
            embedder,
            config,
            store_retry,
            store_timeout,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Top-`k` non-empty chunks for `query`, best first.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::InvalidRequest("query is empty".to_string()));
        }
        if k == 0 {
            return Err(RetrievalError::InvalidRequest("k must be positive".to_string()));
        }

        let query_vector = self.embedder.embed(query).await?;
        let mut hits = call_store(&self.store_retry, self.store_timeout, "search", || {
            self.index.search(&query_vector, k)
        })
        .await?;

        hits.retain(|hit| !hit.chunk.is_placeholder());
        hits.sort_by(rank_order);
        hits.truncate(k);

        debug!(k, hits = hits.len(), "retrieved chunks");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn scored(document_id: &str, sequence_index: u64, text: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                chunk_id: format!("{document_id}-{sequence_index}"),
                document_id: document_id.to_string(),
                source: format!("{document_id}.pdf"),
                sequence_index,
                text: text.to_string(),
                char_start: 0,
                char_end: text.chars().count(),
                page_start: 1,
                page_end: 1,
                chunk_warning: false,
            },
            score,
        }
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ties_fall_back_to_sequence_then_document() {
        let mut hits = vec![
            scored("b", 0, "x", 0.5),
            scored("a", 3, "x", 0.5),
            scored("a", 0, "x", 0.5),
            scored("c", 9, "x", 0.9),
        ];
        hits.sort_by(rank_order);

        let order = hits
            .iter()
            .map(|hit| (hit.chunk.document_id.as_str(), hit.chunk.sequence_index))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![("c", 9), ("a", 0), ("b", 0), ("a", 3)]);
    }

    #[test]
    fn context_stops_at_the_chunk_that_would_overflow() {
        let hits = vec![
            scored("a", 0, "first", 0.9),
            scored("a", 1, "second", 0.8),
            scored("a", 2, "x", 0.7),
        ];
        // "first" + "|" + "second" = 12 chars; adding "|x" would make 14.
        let (context, used) = assemble_context(hits, "|", 13);
        assert_eq!(context, "first|second");
        assert_eq!(used.len(), 2);
    }

    #[test]
    fn context_length_counts_characters_not_bytes() {
        let hits = vec![scored("a", 0, "náuseas", 0.9)];
        let (context, used) = assemble_context(hits, "|", 7);
        assert_eq!(context, "náuseas");
        assert_eq!(used.len(), 1);
    }

    #[test]
    fn oversized_first_chunk_yields_empty_context() {
        let (context, used) = assemble_context(vec![scored("a", 0, "too long", 0.9)], "|", 3);
        assert!(context.is_empty());
        assert!(used.is_empty());
    }
}
