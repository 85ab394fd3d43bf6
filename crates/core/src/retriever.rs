use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::models::{DocScore, MetadataFilter};
use crate::traits::{Reranker, VectorStore};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Turns a query string into scored candidates from a [`VectorStore`].
pub struct Retriever<'a, S, E>
where
    S: VectorStore + ?Sized,
    E: Embedder + ?Sized,
{
    store: &'a S,
    embedder: &'a E,
    reranker: Option<&'a dyn Reranker>,
}

impl<'a, S, E> Retriever<'a, S, E>
where
    S: VectorStore + ?Sized,
    E: Embedder + ?Sized,
{
    pub fn new(store: &'a S, embedder: &'a E) -> Self {
        Self {
            store,
            embedder,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: &'a dyn Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// False when the backend only reports rank order and every score is 0.0.
    pub fn scores_are_meaningful(&self) -> bool {
        self.store.supports_scoring()
    }

    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        rerank: bool,
    ) -> Result<Vec<DocScore>, SearchError> {
        self.retrieve_filtered(query, k, rerank, None).await
    }

    pub async fn retrieve_filtered(
        &self,
        query: &str,
        k: usize,
        rerank: bool,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<DocScore>, SearchError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let Some(vector) = vectors
            .into_iter()
            .next()
            .filter(|vector| !vector.is_empty() && vector.iter().all(|value| value.is_finite()))
        else {
            debug!("query produced no usable embedding");
            return Ok(Vec::new());
        };

        let candidates = self.store.query(&vector, k, filter).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let scores: HashMap<String, f32> = if self.store.supports_scoring() {
            self.store.score(&candidates, &vector).await?
        } else {
            HashMap::new()
        };

        let ordered = match (rerank, self.reranker) {
            (true, Some(reranker)) => match reranker.rerank(&candidates, query).await {
                Ok(reranked) => keep_known(reranked, &candidates),
                Err(error) => {
                    warn!(%error, "reranker failed, keeping vector order");
                    candidates
                }
            },
            (true, None) => {
                debug!("rerank requested without a reranker");
                candidates
            }
            (false, _) => candidates,
        };

        Ok(ordered
            .into_iter()
            .take(k.max(1))
            .map(|id| {
                let score = scores.get(&id).copied().unwrap_or(0.0);
                DocScore { id, score }
            })
            .collect())
    }
}

/// Reranked ids restricted to the original candidates, first occurrence wins.
fn keep_known(reranked: Vec<String>, candidates: &[String]) -> Vec<String> {
    let known: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    reranked
        .into_iter()
        .filter(|id| known.contains(id.as_str()) && seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::{EmbedError, StoreError};
    use crate::models::Metadata;
    use crate::stores::ExactCosineStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::tempdir;

    /// Maps known texts to fixed vectors.
    struct TableEmbedder {
        table: HashMap<String, Vec<f32>>,
    }

    #[async_trait]
    impl Embedder for TableEmbedder {
        fn dimensions(&self) -> Option<usize> {
            Some(2)
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts
                .iter()
                .map(|text| self.table.get(text).cloned().unwrap_or_default())
                .collect())
        }
    }

    struct ReverseReranker;

    #[async_trait]
    impl Reranker for ReverseReranker {
        async fn rerank(&self, ids: &[String], _query: &str) -> Result<Vec<String>, EmbedError> {
            Ok(ids.iter().rev().cloned().collect())
        }
    }

    struct InventingReranker;

    #[async_trait]
    impl Reranker for InventingReranker {
        async fn rerank(&self, ids: &[String], _query: &str) -> Result<Vec<String>, EmbedError> {
            let mut out = vec!["ghost".to_string()];
            out.extend(ids.iter().rev().cloned());
            out.push(ids[0].clone());
            Ok(out)
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn rerank(&self, _ids: &[String], _query: &str) -> Result<Vec<String>, EmbedError> {
            Err(EmbedError::InvalidResponse("reranker offline".to_string()))
        }
    }

    /// Backend that only knows rank order.
    struct RankOnlyStore {
        ids: Vec<String>,
    }

    #[async_trait]
    impl VectorStore for RankOnlyStore {
        fn backend(&self) -> &'static str {
            "rank-only"
        }

        async fn add(
            &mut self,
            _ids: &[String],
            _vectors: &[Vec<f32>],
            _metadatas: Option<&[Metadata]>,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn query(
            &self,
            _vector: &[f32],
            k: usize,
            _filter: Option<&MetadataFilter>,
        ) -> Result<Vec<String>, StoreError> {
            Ok(self.ids.iter().take(k.max(1)).cloned().collect())
        }

        async fn ids_where(&self, _filter: &MetadataFilter) -> Result<Vec<String>, StoreError> {
            Ok(self.ids.clone())
        }

        async fn delete_ids(&mut self, _ids: &[String]) -> Result<usize, StoreError> {
            Ok(0)
        }

        async fn count(&self) -> Result<usize, StoreError> {
            Ok(self.ids.len())
        }

        async fn snapshot(&self) -> Result<PathBuf, StoreError> {
            Err(StoreError::InvalidArgument("no snapshots".to_string()))
        }
    }

    fn embedder() -> TableEmbedder {
        let mut table = HashMap::new();
        table.insert("east".to_string(), vec![1.0, 0.0]);
        table.insert("north".to_string(), vec![0.0, 1.0]);
        TableEmbedder { table }
    }

    async fn compass_store(
        dir: &std::path::Path,
    ) -> Result<ExactCosineStore, Box<dyn std::error::Error>> {
        let mut store = ExactCosineStore::open(dir.join("db"))?;
        let ids: Vec<String> = ["e", "ne", "n"].iter().map(|id| id.to_string()).collect();
        let metadatas: Vec<Metadata> = ["e.md", "ne.md", "n.md"]
            .iter()
            .map(|path| {
                let mut metadata = Metadata::new();
                metadata.insert("path".to_string(), json!(path));
                metadata
            })
            .collect();
        store
            .add(
                &ids,
                &[vec![1.0, 0.0], vec![0.7, 0.7], vec![0.0, 1.0]],
                Some(&metadatas),
            )
            .await?;
        Ok(store)
    }

    #[tokio::test]
    async fn results_are_scored_and_ordered() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = compass_store(dir.path()).await?;
        let embedder = embedder();
        let retriever = Retriever::new(&store, &embedder);

        let hits = retriever.retrieve("east", 2, false).await?;
        assert!(retriever.scores_are_meaningful());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "e");
        assert_eq!(hits[1].id, "ne");
        assert!(hits[0].score > 0.999);
        assert!((hits[1].score - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-3);
        Ok(())
    }

    #[tokio::test]
    async fn blank_or_unembeddable_query_is_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = compass_store(dir.path()).await?;
        let embedder = embedder();
        let retriever = Retriever::new(&store, &embedder);

        assert!(retriever.retrieve("   ", 3, false).await?.is_empty());
        assert!(retriever.retrieve("unknown", 3, false).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn reranked_order_is_kept_and_sanitised() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = compass_store(dir.path()).await?;
        let embedder = embedder();

        let reversed = Retriever::new(&store, &embedder).with_reranker(&ReverseReranker);
        let ids: Vec<_> = reversed
            .retrieve("east", 3, true)
            .await?
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        assert_eq!(ids, vec!["n", "ne", "e"]);

        let inventive = Retriever::new(&store, &embedder).with_reranker(&InventingReranker);
        let hits = inventive.retrieve("east", 3, true).await?;
        let ids: Vec<_> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["n", "ne", "e"]);
        assert!(hits[2].score > 0.999);

        let unused = reversed.retrieve("east", 3, false).await?;
        assert_eq!(unused[0].id, "e");
        Ok(())
    }

    #[tokio::test]
    async fn reranker_failure_falls_back_to_vector_order() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let store = compass_store(dir.path()).await?;
        let embedder = embedder();
        let retriever = Retriever::new(&store, &embedder).with_reranker(&FailingReranker);

        let ids: Vec<_> = retriever
            .retrieve("north", 3, true)
            .await?
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        assert_eq!(ids, vec!["n", "ne", "e"]);
        Ok(())
    }

    #[tokio::test]
    async fn filter_restricts_candidates() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = compass_store(dir.path()).await?;
        let embedder = embedder();
        let retriever = Retriever::new(&store, &embedder);

        let filter = MetadataFilter::new().eq("path", "n.md");
        let hits = retriever
            .retrieve_filtered("east", 3, false, Some(&filter))
            .await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "n");
        Ok(())
    }

    #[tokio::test]
    async fn rank_only_backend_reports_neutral_scores() -> Result<(), SearchError> {
        let store = RankOnlyStore {
            ids: vec!["x".to_string(), "y".to_string(), "z".to_string()],
        };
        let embedder = CharacterNgramEmbedder { dimensions: 8 };
        let retriever = Retriever::new(&store, &embedder);

        let hits = retriever.retrieve("anything at all", 2, false).await?;
        assert!(!retriever.scores_are_meaningful());
        assert_eq!(hits, vec![DocScore::new("x", 0.0), DocScore::new("y", 0.0)]);
        Ok(())
    }

    #[tokio::test]
    async fn works_through_a_trait_object() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store: Box<dyn VectorStore> = Box::new(compass_store(dir.path()).await?);
        let embedder: Box<dyn Embedder> = Box::new(embedder());
        let retriever = Retriever::new(store.as_ref(), embedder.as_ref());
        let hits = retriever.retrieve("north", 1, false).await?;
        assert_eq!(hits[0].id, "n");
        Ok(())
    }
}
