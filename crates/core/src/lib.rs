pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod hashing;
pub mod ingest;
pub mod manifest;
pub mod models;
pub mod persist;
pub mod retriever;
pub mod stores;
pub mod traits;

pub use chunking::{split, ChunkWindows, ChunkingConfig};
pub use config::{EmbeddingProvider, Settings, StoreBackend};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbedError, IngestError, SearchError, StoreError};
pub use hashing::digest_file;
pub use ingest::{discover_files, read_document_text, IngestionPipeline, IngestionStage};
pub use manifest::{diff, FileRecord, Manifest, ManifestDiff};
pub use models::{
    make_chunk_id, Chunk, DocScore, IngestionOptions, IngestionStats, Metadata, MetadataFilter,
};
pub use retriever::Retriever;
pub use stores::{cosine_similarity, ExactCosineStore, QdrantStore};
pub use traits::{Reranker, VectorStore};
