//! Runtime settings, loaded once by the binary and passed down explicitly.
//!
//! Every section is optional in the TOML file:
//!
//! ```toml
//! [paths]
//! doc_root = "data/doc_raw"
//! manifest = "data/file_manifest.json"
//! store_dir = "data/vector_db"
//!
//! [chunking]
//! chunk_size = 500
//! overlap = 100
//!
//! [store]
//! backend = "exact"   # or "qdrant"
//!
//! [embedding]
//! provider = "ngram"  # or "openai"
//! ```

use crate::chunking::ChunkingConfig;
use crate::embeddings::{
    CharacterNgramEmbedder, Embedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
use crate::error::{EmbedError, IngestError, StoreError};
use crate::models::IngestionOptions;
use crate::stores::{ExactCosineStore, QdrantStore};
use crate::traits::VectorStore;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathSettings,
    pub chunking: ChunkingSettings,
    pub ingest: IngestSettings,
    pub store: StoreSettings,
    pub embedding: EmbeddingSettings,
    pub retrieval: RetrievalSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub doc_root: PathBuf,
    pub manifest: PathBuf,
    pub store_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            doc_root: PathBuf::from("data/doc_raw"),
            manifest: PathBuf::from("data/file_manifest.json"),
            store_dir: PathBuf::from("data/vector_db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        let defaults = ChunkingConfig::default();
        Self {
            chunk_size: defaults.chunk_size,
            overlap: defaults.overlap,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub delete_old_versions: bool,
    pub delete_tombstones: bool,
    pub include_extensions: Vec<String>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            delete_old_versions: true,
            delete_tombstones: false,
            include_extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Exact,
    Qdrant,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub qdrant_url: String,
    pub qdrant_collection: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Exact,
            qdrant_url: "http://localhost:6333".to_string(),
            qdrant_collection: "docs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Ngram,
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimensions: Option<usize>,
    pub base_url: String,
    /// Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
    pub batch_size: usize,
    pub max_retries: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Ngram,
            model: "text-embedding-3-large".to_string(),
            dimensions: None,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self { top_k: 10 }
    }
}

impl Settings {
    /// Defaults when `path` is `None`; otherwise the named file must exist
    /// and parse.
    pub fn load(path: Option<&Path>) -> Result<Self, IngestError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Err(IngestError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|details| IngestError::Config {
            path: path.to_path_buf(),
            details,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        let settings: Self = toml::from_str(content).map_err(|error| error.to_string())?;
        settings
            .chunking_config()
            .validate()
            .map_err(|error| error.to_string())?;
        Ok(settings)
    }

    pub fn chunking_config(&self) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: self.chunking.chunk_size,
            overlap: self.chunking.overlap,
        }
    }

    pub fn ingestion_options(&self) -> IngestionOptions {
        IngestionOptions {
            chunk_size: self.chunking.chunk_size,
            overlap: self.chunking.overlap,
            delete_old_versions: self.ingest.delete_old_versions,
            delete_tombstones: self.ingest.delete_tombstones,
            include_extensions: self
                .ingest
                .include_extensions
                .iter()
                .map(|extension| extension.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn build_embedder(&self) -> Result<Box<dyn Embedder>, EmbedError> {
        let settings = &self.embedding;
        match settings.provider {
            EmbeddingProvider::Ngram => Ok(Box::new(CharacterNgramEmbedder {
                dimensions: settings.dimensions.unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS),
            })),
            EmbeddingProvider::OpenAi => {
                let api_key = settings
                    .api_key
                    .clone()
                    .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                    .unwrap_or_default();
                Ok(Box::new(OpenAiEmbedder::new(
                    &api_key,
                    &settings.base_url,
                    &settings.model,
                    settings.dimensions,
                    Duration::from_secs(settings.timeout_secs),
                    settings.max_retries,
                    settings.batch_size,
                )?))
            }
        }
    }

    /// Opens the configured backend. `vector_size` is required by backends
    /// that must declare a dimension up front.
    pub async fn open_store(
        &self,
        vector_size: Option<usize>,
    ) -> Result<Box<dyn VectorStore>, StoreError> {
        match self.store.backend {
            StoreBackend::Exact => Ok(Box::new(ExactCosineStore::open(&self.paths.store_dir)?)),
            StoreBackend::Qdrant => {
                let size = vector_size.ok_or_else(|| {
                    StoreError::InvalidArgument(
                        "qdrant backend needs embedding.dimensions".to_string(),
                    )
                })?;
                let store = QdrantStore::new(
                    &self.store.qdrant_url,
                    self.store.qdrant_collection.clone(),
                    size,
                )?;
                store.ensure_collection().await?;
                Ok(Box::new(store))
            }
        }
    }
}
