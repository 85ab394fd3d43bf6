use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("expected a file, got a directory: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("manifest is not valid JSON: {}: {source}", path.display())]
    CorruptManifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("path is outside the document root: {}", .0.display())]
    OutsideRoot(PathBuf),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid config {}: {details}", path.display())]
    Config { path: PathBuf, details: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("snapshot destination already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding request failed ({status}): {body}")]
    Request { status: u16, body: String },

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedder misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
