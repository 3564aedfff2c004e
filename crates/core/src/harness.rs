use crate::citations::assemble_citations;
use crate::embeddings::Embedder;
use crate::error::{ErrorKind, RetrievalError};
use crate::models::{QueryRequest, QueryResult};
use crate::retrieval::{assemble_context, Retriever};
use crate::traits::ChunkIndex;
use std::future::Future;
use tracing::{info, warn};

/// Entry point for queries: retrieval, context assembly and citations. Every
/// failure is folded into `QueryResult::error`.
pub struct QueryHarness<I, E> {
    retriever: Retriever<I, E>,
}

impl<I, E> QueryHarness<I, E>
where
    I: ChunkIndex,
    E: Embedder,
{
    pub fn new(retriever: Retriever<I, E>) -> Self {
        Self { retriever }
    }

    pub async fn run_query(&self, request: &QueryRequest) -> QueryResult {
        match self.answer(request).await {
            Ok(result) => result,
            Err(error) => {
                warn!(kind = ?error.kind(), %error, "query failed");
                QueryResult::failed(error.kind(), error.to_string(), error.is_retryable())
            }
        }
    }

    /// Like `run_query`, but gives up with `Cancelled` as soon as `cancel` resolves.
    pub async fn run_query_until<C>(&self, request: &QueryRequest, cancel: C) -> QueryResult
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                info!("query cancelled by caller");
                QueryResult::failed(ErrorKind::Cancelled, "query cancelled", false)
            }
            result = self.run_query(request) => result,
        }
    }

    async fn answer(&self, request: &QueryRequest) -> Result<QueryResult, RetrievalError> {
        let config = self.retriever.config();
        let k = match request.k {
            Some(0) => {
                return Err(RetrievalError::InvalidRequest("k must be positive".to_string()))
            }
            Some(k) => k.min(config.max_k),
            None => config.default_k,
        };
        let max_context_length = match request.max_context_length {
            Some(0) => {
                return Err(RetrievalError::InvalidRequest(
                    "max_context_length must be positive".to_string(),
                ))
            }
            Some(length) => length,
            None => config.max_context_length,
        };

        let ranked = self.retriever.retrieve(&request.query, k).await?;
        let (context_text, used) = assemble_context(ranked, &config.separator, max_context_length);
        let citations = assemble_citations(&used);

        info!(k, chunks = used.len(), documents = citations.len(), "query answered");
        Ok(QueryResult {
            context_text,
            citations,
            error: None,
        })
    }
}
