use crate::error::StoreError;
use crate::models::{Metadata, MetadataFilter};
use crate::stores::exact::cosine_similarity;
use crate::traits::VectorStore;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

const BACKEND: &str = "qdrant";
const SCROLL_PAGE: usize = 256;

/// Vector store backed by a Qdrant collection over its REST API.
///
/// Qdrant point ids must be integers or UUIDs, so each chunk id is mapped to a
/// UUIDv5 and the original id travels in the `chunk_id` payload field.
/// Scores are recomputed as exact cosine from the stored vectors, so they
/// match [`ExactCosineStore`](super::ExactCosineStore) for the same data.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Result<Self, StoreError> {
        let parsed = Url::parse(endpoint)?;
        if vector_size == 0 {
            return Err(StoreError::InvalidArgument(
                "qdrant vector size must be positive".to_string(),
            ));
        }
        Ok(Self {
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        })
    }

    /// Creates the collection with cosine distance when it is missing.
    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let response = self.client.get(self.collection_url("")).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status()));
        }

        let response = self
            .client
            .put(self.collection_url(""))
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Cosine" }
            }))
            .send()
            .await?;
        check_status(response).await?;
        info!(collection = %self.collection, size = self.vector_size, "qdrant collection created");
        Ok(())
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.endpoint, self.collection, suffix)
    }

    async fn post(&self, suffix: &str, body: Value) -> Result<Value, StoreError> {
        let response = self
            .client
            .post(self.collection_url(suffix))
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Existing points among `chunk_ids`, optionally with their vectors.
    async fn fetch_points(
        &self,
        chunk_ids: &[String],
        with_vector: bool,
    ) -> Result<Vec<Value>, StoreError> {
        let point_ids: Vec<String> = chunk_ids.iter().map(|id| point_id(id).to_string()).collect();
        let parsed = self
            .post(
                "/points",
                json!({
                    "ids": point_ids,
                    "with_payload": ["chunk_id"],
                    "with_vector": with_vector,
                }),
            )
            .await?;
        Ok(parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn point_id(chunk_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes())
}

pub fn filter_to_json(filter: &MetadataFilter) -> Value {
    let must: Vec<Value> = filter
        .equals
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect();
    json!({ "must": must })
}

fn vectors_from(points: &[Value]) -> Vec<(String, Vec<f32>)> {
    points
        .iter()
        .filter_map(|point| {
            let id = point.pointer("/payload/chunk_id")?.as_str()?;
            let vector = point
                .get("vector")?
                .as_array()?
                .iter()
                .map(|value| value.as_f64().map(|value| value as f32))
                .collect::<Option<Vec<f32>>>()?;
            Some((id.to_string(), vector))
        })
        .collect()
}

fn chunk_ids_from(points: &[Value]) -> Vec<String> {
    points
        .iter()
        .filter_map(|point| point.pointer("/payload/chunk_id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn backend_error(status: StatusCode) -> StoreError {
    StoreError::BackendResponse {
        backend: BACKEND.to_string(),
        details: status.to_string(),
    }
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::BackendResponse {
        backend: BACKEND.to_string(),
        details: format!("{status}: {body}"),
    })
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn supports_scoring(&self) -> bool {
        true
    }

    async fn add(
        &mut self,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: Option<&[Metadata]>,
    ) -> Result<(), StoreError> {
        if ids.is_empty() && vectors.is_empty() {
            return Ok(());
        }
        if ids.len() != vectors.len() {
            return Err(StoreError::ShapeMismatch(format!(
                "{} ids for {} vectors",
                ids.len(),
                vectors.len()
            )));
        }
        if let Some(metadatas) = metadatas {
            if metadatas.len() != ids.len() {
                return Err(StoreError::ShapeMismatch(format!(
                    "{} metadatas for {} ids",
                    metadatas.len(),
                    ids.len()
                )));
            }
        }

        let points = ids
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(position, (id, vector))| {
                if vector.len() != self.vector_size {
                    return Err(StoreError::ShapeMismatch(format!(
                        "embedding dimension {} != {}",
                        vector.len(),
                        self.vector_size
                    )));
                }

                let mut payload = metadatas
                    .and_then(|metadatas| metadatas.get(position))
                    .cloned()
                    .unwrap_or_default();
                payload.insert("chunk_id".to_string(), Value::String(id.clone()));

                Ok(json!({
                    "id": point_id(id).to_string(),
                    "vector": vector,
                    "payload": payload,
                }))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let response = self
            .client
            .put(self.collection_url("/points?wait=true"))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check_status(response).await?;

        debug!(collection = %self.collection, upserted = ids.len(), "qdrant points upserted");
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<String>, StoreError> {
        if vector.len() != self.vector_size {
            return Err(StoreError::ShapeMismatch(format!(
                "query vector dim {} is not {}",
                vector.len(),
                self.vector_size
            )));
        }

        let mut body = json!({
            "vector": vector,
            "limit": k.max(1),
            "with_payload": ["chunk_id"],
        });
        if let Some(filter) = filter.filter(|filter| !filter.is_empty()) {
            body["filter"] = filter_to_json(filter);
        }

        let response = self
            .client
            .post(self.collection_url("/points/search"))
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let parsed: Value = check_status(response).await?.json().await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(chunk_ids_from(&hits))
    }

    async fn score(
        &self,
        ids: &[String],
        vector: &[f32],
    ) -> Result<HashMap<String, f32>, StoreError> {
        if vector.len() != self.vector_size {
            return Err(StoreError::ShapeMismatch(format!(
                "query vector dim {} is not {}",
                vector.len(),
                self.vector_size
            )));
        }
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let points = self.fetch_points(ids, true).await?;
        Ok(vectors_from(&points)
            .into_iter()
            .map(|(id, stored)| {
                let score = cosine_similarity(&stored, vector);
                (id, score)
            })
            .collect())
    }

    async fn ids_where(&self, filter: &MetadataFilter) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut offset = Value::Null;

        loop {
            let mut body = json!({
                "filter": filter_to_json(filter),
                "limit": SCROLL_PAGE,
                "with_payload": ["chunk_id"],
                "with_vector": false,
            });
            if !offset.is_null() {
                body["offset"] = offset.clone();
            }

            let parsed = self.post("/points/scroll", body).await?;
            let points = parsed
                .pointer("/result/points")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            ids.extend(chunk_ids_from(&points));

            offset = parsed
                .pointer("/result/next_page_offset")
                .cloned()
                .unwrap_or(Value::Null);
            if offset.is_null() {
                break;
            }
        }

        Ok(ids)
    }

    async fn delete_ids(&mut self, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let existing = chunk_ids_from(&self.fetch_points(ids, false).await?);
        if existing.is_empty() {
            return Ok(0);
        }
        let points: Vec<String> = existing
            .iter()
            .map(|id| point_id(id).to_string())
            .collect();
        self.post("/points/delete?wait=true", json!({ "points": points }))
            .await?;
        debug!(collection = %self.collection, removed = existing.len(), "qdrant points deleted");
        Ok(existing.len())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let parsed = self.post("/points/count", json!({ "exact": true })).await?;
        parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .map(|count| count as usize)
            .ok_or_else(|| StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: "count missing from response".to_string(),
            })
    }

    /// Asks the server for a collection snapshot; the returned path is the
    /// server-side snapshot name.
    async fn snapshot(&self) -> Result<PathBuf, StoreError> {
        let parsed = self.post("/snapshots", json!({})).await?;
        let name = parsed
            .pointer("/result/name")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: "snapshot name missing from response".to_string(),
            })?;
        info!(collection = %self.collection, snapshot = name, "qdrant snapshot created");
        Ok(PathBuf::from(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable_per_chunk_id() {
        assert_eq!(point_id("a.md::d::0"), point_id("a.md::d::0"));
        assert_ne!(point_id("a.md::d::0"), point_id("a.md::d::1"));
    }

    #[test]
    fn filter_becomes_must_clauses() {
        let filter = MetadataFilter::file_version("a.md", "abc");
        assert_eq!(
            filter_to_json(&filter),
            json!({
                "must": [
                    { "key": "path", "match": { "value": "a.md" } },
                    { "key": "sha256", "match": { "value": "abc" } }
                ]
            })
        );
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        assert!(matches!(
            QdrantStore::new("not a url", "docs", 8),
            Err(StoreError::Url(_))
        ));
        assert!(QdrantStore::new("http://localhost:6333/", "docs", 0).is_err());
    }

    #[test]
    fn payload_chunk_ids_are_extracted() {
        let points = vec![
            json!({ "id": "x", "payload": { "chunk_id": "a.md::d::0" } }),
            json!({ "id": "y", "payload": {} }),
        ];
        assert_eq!(chunk_ids_from(&points), vec!["a.md::d::0".to_string()]);
    }

    #[test]
    fn stored_vectors_are_paired_with_chunk_ids() {
        let points = vec![
            json!({ "id": "x", "payload": { "chunk_id": "a.md::d::0" }, "vector": [0.6, 0.8] }),
            json!({ "id": "y", "payload": { "chunk_id": "a.md::d::1" } }),
            json!({ "id": "z", "payload": { "chunk_id": "a.md::d::2" }, "vector": ["bad"] }),
        ];
        let vectors = vectors_from(&points);
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].0, "a.md::d::0");
        assert!((cosine_similarity(&vectors[0].1, &[0.6, 0.8]) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn empty_requests_need_no_server() -> Result<(), StoreError> {
        let mut store = QdrantStore::new("http://127.0.0.1:9", "docs", 2)?;
        assert!(store.supports_scoring());
        assert!(store.score(&[], &[1.0, 0.0]).await?.is_empty());
        assert_eq!(store.delete_ids(&[]).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn shape_mismatch_fails_before_any_request() -> Result<(), StoreError> {
        let mut store = QdrantStore::new("http://127.0.0.1:9", "docs", 3)?;
        let ids = vec!["a".to_string()];
        let result = store.add(&ids, &[vec![1.0, 2.0]], None).await;
        assert!(matches!(result, Err(StoreError::ShapeMismatch(_))));

        let query = store.query(&[1.0], 3, None).await;
        assert!(matches!(query, Err(StoreError::ShapeMismatch(_))));
        assert!(store.add(&[], &[], None).await.is_ok());
        Ok(())
    }
}
