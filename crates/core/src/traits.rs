use crate::error::{EmbedError, StoreError};
use crate::models::{Metadata, MetadataFilter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

/// Persistent collection of `(id, vector, metadata)` records.
///
/// A single implementation is selected at startup from configuration; callers
/// only ever see ids and metadata.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;

    /// Whether [`VectorStore::score`] reports real similarities. Backends that
    /// only expose rank order return `false` and an empty score map.
    fn supports_scoring(&self) -> bool {
        false
    }

    /// Insert-or-replace by id. `metadatas`, when given, must match `ids`.
    async fn add(
        &mut self,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: Option<&[Metadata]>,
    ) -> Result<(), StoreError>;

    /// Up to `k` ids (at least one), most similar first.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<String>, StoreError>;

    async fn score(
        &self,
        _ids: &[String],
        _vector: &[f32],
    ) -> Result<HashMap<String, f32>, StoreError> {
        Ok(HashMap::new())
    }

    async fn ids_where(&self, filter: &MetadataFilter) -> Result<Vec<String>, StoreError>;

    /// Removes the given ids, returning how many existed.
    async fn delete_ids(&mut self, ids: &[String]) -> Result<usize, StoreError>;

    /// Resolves matching ids, then deletes them by id. Returns the ids that
    /// were selected for deletion. An empty filter selects nothing.
    async fn delete_where(&mut self, filter: &MetadataFilter) -> Result<Vec<String>, StoreError> {
        if filter.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.ids_where(filter).await?;
        if !ids.is_empty() {
            self.delete_ids(&ids).await?;
        }
        Ok(ids)
    }

    async fn count(&self) -> Result<usize, StoreError>;

    async fn snapshot(&self) -> Result<PathBuf, StoreError>;
}

/// Reorders candidate ids for a query. May drop ids, never invents them.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, ids: &[String], query: &str) -> Result<Vec<String>, EmbedError>;
}
