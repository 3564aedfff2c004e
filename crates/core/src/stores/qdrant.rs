use crate::models::{Chunk, DocumentRecord, IndexStats, IndexedChunk, ScoredChunk};
use crate::retrieval::rank_order;
use crate::traits::ChunkIndex;
use crate::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use url::Url;
use uuid::Uuid;

const SCROLL_PAGE: usize = 256;

/// Over-fetch factor so that dropping stale generations still leaves `limit` hits.
const SEARCH_OVERFETCH: usize = 4;

/// Qdrant over its REST API. Each replacement writes points under a fresh
/// generation and only then deletes the other generations of the document.
pub struct QdrantStore {
    endpoint: Url,
    collection: String,
    api_key: Option<String>,
    client: Client,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        api_key: Option<String>,
        vector_size: usize,
    ) -> Result<Self, StoreError> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Ok(Self {
            endpoint,
            collection: collection.into(),
            api_key,
            client: Client::new(),
            vector_size,
        })
    }

    fn url(&self, suffix: &str) -> Result<Url, StoreError> {
        Ok(self
            .endpoint
            .join(&format!("collections/{}{}", self.collection, suffix))?)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.api_key {
            Some(api_key) => request.header("api-key", api_key),
            None => request,
        }
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        suffix: &str,
        body: Value,
    ) -> Result<Value, StoreError> {
        let response = self
            .request(method, self.url(suffix)?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(response.json().await?)
    }

    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::GET, self.url("")?)
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            let parsed: Value = response.json().await?;
            let size = parsed
                .pointer("/result/config/params/vectors/size")
                .and_then(Value::as_u64)
                .unwrap_or_default() as usize;
            if size != self.vector_size {
                return Err(StoreError::Request(format!(
                    "collection vector size {} does not match embedder {}",
                    size, self.vector_size
                )));
            }
            return Ok(());
        }

        if response.status() != StatusCode::NOT_FOUND {
            return Err(StoreError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        self.send_json(
            reqwest::Method::PUT,
            "",
            json!({ "vectors": { "size": self.vector_size, "distance": "Cosine" } }),
        )
        .await?;
        self.send_json(
            reqwest::Method::PUT,
            "/index?wait=true",
            json!({ "field_name": "document_id", "field_schema": "keyword" }),
        )
        .await?;
        Ok(())
    }

    async fn scroll(&self, filter: Value) -> Result<Vec<Value>, StoreError> {
        let mut points = Vec::new();
        let mut offset = Value::Null;

        loop {
            let mut body = json!({
                "filter": filter,
                "limit": SCROLL_PAGE,
                "with_payload": true,
                "with_vector": false,
            });
            if !offset.is_null() {
                body["offset"] = offset.clone();
            }

            let parsed = self
                .send_json(reqwest::Method::POST, "/points/scroll", body)
                .await?;
            if let Some(page) = parsed.pointer("/result/points").and_then(Value::as_array) {
                points.extend(page.iter().cloned());
            }
            offset = parsed
                .pointer("/result/next_page_offset")
                .cloned()
                .unwrap_or(Value::Null);
            if offset.is_null() {
                break;
            }
        }

        Ok(points)
    }

    async fn count(&self, filter: Option<Value>) -> Result<usize, StoreError> {
        let mut body = json!({ "exact": true });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        let parsed = self
            .send_json(reqwest::Method::POST, "/points/count", body)
            .await?;
        Ok(parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or_default() as usize)
    }
}

fn match_filter(key: &str, value: Value) -> Value {
    json!({ "key": key, "match": { "value": value } })
}

/// A point payload decoded back into its chunk and generation stamp.
struct StoredPoint {
    chunk: Chunk,
    generation: String,
    written_at: i64,
    score: f32,
    record: Option<DocumentRecord>,
}

fn decode_point(point: &Value) -> Result<StoredPoint, StoreError> {
    let payload = point.pointer("/payload").ok_or_else(|| StoreError::BackendResponse {
        backend: "qdrant".to_string(),
        details: "point without payload".to_string(),
    })?;
    let chunk: Chunk = serde_json::from_value(payload.get("chunk").cloned().unwrap_or(Value::Null))?;
    let record = payload
        .get("record")
        .cloned()
        .map(serde_json::from_value::<DocumentRecord>)
        .transpose()?;

    Ok(StoredPoint {
        chunk,
        generation: payload
            .get("generation")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        written_at: payload.get("written_at").and_then(Value::as_i64).unwrap_or_default(),
        score: point.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
        record,
    })
}

/// Keeps, per document, only points of the newest generation present.
fn newest_generation(points: Vec<StoredPoint>) -> Vec<StoredPoint> {
    let mut newest: HashMap<String, (i64, String)> = HashMap::new();
    for point in &points {
        let candidate = (point.written_at, point.generation.clone());
        newest
            .entry(point.chunk.document_id.clone())
            .and_modify(|current| {
                if candidate > *current {
                    *current = candidate.clone();
                }
            })
            .or_insert(candidate);
    }

    points
        .into_iter()
        .filter(|point| {
            newest
                .get(&point.chunk.document_id)
                .is_some_and(|(_, generation)| *generation == point.generation)
        })
        .collect()
}

#[async_trait]
impl ChunkIndex for QdrantStore {
    async fn replace_document(
        &self,
        record: &DocumentRecord,
        entries: &[IndexedChunk],
    ) -> Result<(), StoreError> {
        let generation = Uuid::new_v4().to_string();
        let written_at = Utc::now().timestamp_millis();

        let points = entries
            .iter()
            .map(|entry| {
                if entry.embedding.len() != self.vector_size {
                    return Err(StoreError::Request(format!(
                        "embedding dimension {} != {}",
                        entry.embedding.len(),
                        self.vector_size
                    )));
                }

                Ok(json!({
                    "id": Uuid::new_v4().to_string(),
                    "vector": entry.embedding,
                    "payload": {
                        "document_id": entry.chunk.document_id,
                        "generation": generation,
                        "written_at": written_at,
                        "placeholder": entry.chunk.is_placeholder(),
                        "chunk_warning": entry.chunk.chunk_warning,
                        "chunk": entry.chunk,
                        "record": record,
                    },
                }))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        if !points.is_empty() {
            self.send_json(
                reqwest::Method::PUT,
                "/points?wait=true",
                json!({ "points": points }),
            )
            .await?;
        }

        self.send_json(
            reqwest::Method::POST,
            "/points/delete?wait=true",
            json!({
                "filter": {
                    "must": [match_filter("document_id", json!(record.document_id))],
                    "must_not": [match_filter("generation", json!(generation))],
                }
            }),
        )
        .await?;

        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if query_vector.len() != self.vector_size {
            return Err(StoreError::Request(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                self.vector_size
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let parsed = self
            .send_json(
                reqwest::Method::POST,
                "/points/search",
                json!({
                    "vector": query_vector,
                    "limit": limit.saturating_mul(SEARCH_OVERFETCH),
                    "with_payload": true,
                    "filter": { "must": [match_filter("placeholder", json!(false))] },
                }),
            )
            .await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let points = hits.iter().map(decode_point).collect::<Result<Vec<_>, _>>()?;
        let mut scored = newest_generation(points)
            .into_iter()
            .map(|point| ScoredChunk {
                chunk: point.chunk,
                score: point.score,
            })
            .collect::<Vec<_>>();
        scored.sort_by(rank_order);
        scored.truncate(limit);
        Ok(scored)
    }

    async fn document_record(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        let points = self
            .scroll(json!({ "must": [match_filter("document_id", json!(document_id))] }))
            .await?
            .iter()
            .map(decode_point)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(newest_generation(points)
            .into_iter()
            .find_map(|point| point.record))
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let points = self
            .scroll(json!({ "must": [match_filter("document_id", json!(document_id))] }))
            .await?
            .iter()
            .map(decode_point)
            .collect::<Result<Vec<_>, _>>()?;
        let mut chunks = newest_generation(points)
            .into_iter()
            .map(|point| point.chunk)
            .collect::<Vec<_>>();
        chunks.sort_by_key(|chunk| chunk.sequence_index);
        Ok(chunks)
    }

    async fn stats(&self) -> Result<IndexStats, StoreError> {
        let chunks = self.count(None).await?;
        let warning_chunks = self
            .count(Some(json!({ "must": [match_filter("chunk_warning", json!(true))] })))
            .await?;
        Ok(IndexStats {
            documents: None,
            chunks,
            warning_chunks,
        })
    }
}
