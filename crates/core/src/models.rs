use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Free-form metadata attached to each stored vector.
pub type Metadata = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub source_path: String,
    pub index: usize,
    pub text: String,
    /// Character offset of `text` within the source, inclusive.
    pub start_offset: usize,
    /// Character offset of `text` within the source, exclusive.
    pub end_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocScore {
    pub id: String,
    pub score: f32,
}

impl DocScore {
    pub fn new(id: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

/// Conjunction of `key == value` metadata predicates.
///
/// An empty filter matches every record in `query`, and nothing in
/// `delete_where`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub equals: Vec<(String, Value)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    /// Records belonging to one content version of one file.
    pub fn file_version(path: &str, digest: &str) -> Self {
        Self::new().eq("path", path).eq("sha256", digest)
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// Canonical vector id for one chunk of one file version.
pub fn make_chunk_id(relative_path: &str, digest: &str, chunk_index: usize) -> String {
    format!("{relative_path}::{digest}::{chunk_index}")
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub overlap: usize,
    pub delete_old_versions: bool,
    pub delete_tombstones: bool,
    /// Lowercase extensions without the dot; empty means every file.
    pub include_extensions: Vec<String>,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap: 100,
            delete_old_versions: true,
            delete_tombstones: false,
            include_extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionStats {
    pub files_scanned: usize,
    pub to_process: usize,
    pub unchanged: usize,
    pub tombstones: usize,
    pub chunks_embedded: usize,
    pub vectors_upserted: usize,
    pub deleted_old_versions: usize,
    pub deleted_tombstones: usize,
    /// UTF-8 bytes of chunk text sent to the embedder during the run.
    pub embedded_bytes: usize,
    pub manifest_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_id_uses_path_digest_and_index() {
        assert_eq!(make_chunk_id("docs/a.md", "abc", 2), "docs/a.md::abc::2");
    }

    #[test]
    fn filter_requires_every_predicate() {
        let mut metadata = Metadata::new();
        metadata.insert("path".to_string(), json!("a.md"));
        metadata.insert("sha256".to_string(), json!("d1"));

        assert!(MetadataFilter::file_version("a.md", "d1").matches(&metadata));
        assert!(!MetadataFilter::file_version("a.md", "d2").matches(&metadata));
        assert!(MetadataFilter::new().matches(&metadata));
        assert!(!MetadataFilter::new().eq("missing", 1).matches(&metadata));
    }
}
