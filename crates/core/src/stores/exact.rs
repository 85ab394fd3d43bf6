//! Exact-cosine vector store persisted as a single JSON file.
//!
//! Every mutation rewrites `store.json` through a temp file and rename, so a
//! reader of the directory sees either the state before or after a batch.
//! Queries score every candidate and select the top k with a partial sort.

use crate::error::StoreError;
use crate::models::{Metadata, MetadataFilter};
use crate::persist::write_atomic;
use crate::traits::VectorStore;
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const STORE_FILE_NAME: &str = "store.json";

const NORM_EPSILON: f32 = 1e-12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    dimension: Option<usize>,
    #[serde(default)]
    records: Vec<StoredRecord>,
}

pub struct ExactCosineStore {
    persist_dir: PathBuf,
    dimension: Option<usize>,
    records: Vec<StoredRecord>,
    id_to_index: HashMap<String, usize>,
}

impl ExactCosineStore {
    /// Opens (or creates) the store under `persist_dir`.
    pub fn open(persist_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let persist_dir = persist_dir.into();
        fs::create_dir_all(&persist_dir)?;

        let db_file = persist_dir.join(STORE_FILE_NAME);
        let state = if db_file.exists() {
            serde_json::from_slice::<StoreFile>(&fs::read(&db_file)?)?
        } else {
            StoreFile::default()
        };

        let mut store = Self {
            persist_dir,
            dimension: state.dimension,
            records: Vec::with_capacity(state.records.len()),
            id_to_index: HashMap::new(),
        };
        for record in state.records {
            store.upsert_record(record);
        }
        if store.dimension.is_none() {
            store.dimension = store.records.first().map(|record| record.embedding.len());
        }

        debug!(
            path = %store.persist_dir.display(),
            records = store.records.len(),
            "exact store opened"
        );
        Ok(store)
    }

    pub fn persist_dir(&self) -> &Path {
        &self.persist_dir
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn metadata(&self, id: &str) -> Option<&Metadata> {
        self.id_to_index
            .get(id)
            .map(|index| &self.records[*index].metadata)
    }

    /// Copies the store directory to `<parent>/snapshots/<dir>_<label>`.
    pub fn snapshot_labeled(&self, label: &str) -> Result<PathBuf, StoreError> {
        let dir_name = self.persist_dir.file_name().ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "store directory has no name: {}",
                self.persist_dir.display()
            ))
        })?;
        let parent = self.persist_dir.parent().unwrap_or_else(|| Path::new("."));

        let mut snapshot_name = dir_name.to_os_string();
        snapshot_name.push(format!("_{label}"));
        let destination = parent.join("snapshots").join(snapshot_name);
        if destination.exists() {
            return Err(StoreError::AlreadyExists(destination));
        }

        copy_dir(&self.persist_dir, &destination)?;
        info!(
            source = %self.persist_dir.display(),
            destination = %destination.display(),
            "store snapshot written"
        );
        Ok(destination)
    }

    fn upsert_record(&mut self, record: StoredRecord) {
        upsert_into(&mut self.records, &mut self.id_to_index, record);
    }

    /// Persists `records` and only then makes them the live state.
    fn commit(
        &mut self,
        dimension: Option<usize>,
        records: Vec<StoredRecord>,
        id_to_index: HashMap<String, usize>,
    ) -> Result<(), StoreError> {
        save_state(&self.persist_dir, dimension, &records)?;
        self.dimension = dimension;
        self.records = records;
        self.id_to_index = id_to_index;
        Ok(())
    }

    fn check_batch(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: Option<&[Metadata]>,
    ) -> Result<usize, StoreError> {
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

        let dimension = self
            .dimension
            .or_else(|| vectors.first().map(Vec::len))
            .unwrap_or_default();
        if dimension == 0 {
            return Err(StoreError::ShapeMismatch(
                "vectors must not be empty".to_string(),
            ));
        }
        for (id, vector) in ids.iter().zip(vectors) {
            if vector.len() != dimension {
                return Err(StoreError::ShapeMismatch(format!(
                    "vector for {id} has dimension {}, store uses {dimension}",
                    vector.len()
                )));
            }
            if vector.iter().any(|value| !value.is_finite()) {
                return Err(StoreError::InvalidArgument(format!(
                    "vector for {id} has non-finite components"
                )));
            }
        }
        Ok(dimension)
    }

    fn check_query(&self, vector: &[f32]) -> Result<(), StoreError> {
        match self.dimension {
            Some(dimension) if dimension != vector.len() => Err(StoreError::ShapeMismatch(
                format!("query has dimension {}, store uses {dimension}", vector.len()),
            )),
            _ => Ok(()),
        }
    }
}

fn upsert_into(
    records: &mut Vec<StoredRecord>,
    id_to_index: &mut HashMap<String, usize>,
    record: StoredRecord,
) {
    match id_to_index.get(&record.id) {
        Some(index) => records[*index] = record,
        None => {
            id_to_index.insert(record.id.clone(), records.len());
            records.push(record);
        }
    }
}

fn save_state(
    persist_dir: &Path,
    dimension: Option<usize>,
    records: &[StoredRecord],
) -> Result<(), StoreError> {
    let payload = serde_json::to_vec(&StoreFileRef { dimension, records })?;
    write_atomic(&persist_dir.join(STORE_FILE_NAME), &payload)?;
    Ok(())
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    dimension: Option<usize>,
    records: &'a [StoredRecord],
}

#[async_trait]
impl VectorStore for ExactCosineStore {
    fn backend(&self) -> &'static str {
        "exact"
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
        let dimension = self.check_batch(ids, vectors, metadatas)?;

        let mut records = self.records.clone();
        let mut id_to_index = self.id_to_index.clone();
        for (position, (id, vector)) in ids.iter().zip(vectors).enumerate() {
            let metadata = metadatas
                .and_then(|metadatas| metadatas.get(position))
                .cloned()
                .unwrap_or_default();
            upsert_into(
                &mut records,
                &mut id_to_index,
                StoredRecord {
                    id: id.clone(),
                    embedding: vector.clone(),
                    metadata,
                },
            );
        }

        self.commit(Some(dimension), records, id_to_index)?;
        debug!(upserted = ids.len(), total = self.records.len(), "vectors upserted");
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<String>, StoreError> {
        if self.records.is_empty() {
            return Ok(Vec::new());
        }
        self.check_query(vector)?;

        let mut scored: Vec<(f32, &str)> = self
            .records
            .iter()
            .filter(|record| filter.map_or(true, |filter| filter.matches(&record.metadata)))
            .map(|record| (cosine_similarity(&record.embedding, vector), record.id.as_str()))
            .collect();

        let top = top_k(&mut scored, k);
        Ok(top.iter().map(|(_, id)| (*id).to_string()).collect())
    }

    async fn score(
        &self,
        ids: &[String],
        vector: &[f32],
    ) -> Result<HashMap<String, f32>, StoreError> {
        self.check_query(vector)?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.id_to_index.get(id).map(|index| {
                    let score = cosine_similarity(&self.records[*index].embedding, vector);
                    (id.clone(), score)
                })
            })
            .collect())
    }

    async fn ids_where(&self, filter: &MetadataFilter) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|record| filter.matches(&record.metadata))
            .map(|record| record.id.clone())
            .collect())
    }

    async fn delete_ids(&mut self, ids: &[String]) -> Result<usize, StoreError> {
        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let records: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|record| !doomed.contains(record.id.as_str()))
            .cloned()
            .collect();
        let removed = self.records.len() - records.len();
        if removed == 0 {
            return Ok(0);
        }

        let id_to_index = records
            .iter()
            .enumerate()
            .map(|(index, record)| (record.id.clone(), index))
            .collect();
        self.commit(self.dimension, records, id_to_index)?;
        debug!(removed, total = self.records.len(), "vectors deleted");
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.len())
    }

    async fn snapshot(&self) -> Result<PathBuf, StoreError> {
        self.snapshot_labeled(&Local::now().format("%Y%m%d_%H%M%S").to_string())
    }
}

/// Cosine similarity clamped to `[-1, 1]`; zero vectors score 0.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt() + NORM_EPSILON;
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt() + NORM_EPSILON;
    (dot / (left_norm * right_norm)).clamp(-1.0, 1.0)
}

/// Higher score first, then ascending id.
fn rank_order(left: &(f32, &str), right: &(f32, &str)) -> Ordering {
    right.0.total_cmp(&left.0).then_with(|| left.1.cmp(right.1))
}

/// Keeps the `k` best entries (at least one) in rank order.
fn top_k<'a, 'b>(scored: &'a mut Vec<(f32, &'b str)>, k: usize) -> &'a [(f32, &'b str)] {
    let k = k.max(1).min(scored.len());
    if k == 0 {
        return &scored[..0];
    }
    if k < scored.len() {
        scored.select_nth_unstable_by(k - 1, rank_order);
        scored.truncate(k);
    }
    scored.sort_by(rank_order);
    scored
}

fn copy_dir(source: &Path, destination: &Path) -> Result<(), StoreError> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|error| {
            StoreError::Io(error.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "directory walk failed")
            }))
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| StoreError::NotFound(entry.path().to_path_buf()))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
