use crate::chunking::{self, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::{EmbedError, IngestError};
use crate::hashing::digest_file;
use crate::manifest::{diff, FileRecord, Manifest};
use crate::models::{make_chunk_id, Chunk, IngestionOptions, IngestionStats, Metadata, MetadataFilter};
use crate::traits::VectorStore;
use serde_json::json;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Regular files under `folder`, recursively, sorted. `extensions` are
/// lowercase without the dot; an empty list keeps every file.
pub fn discover_files(folder: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let wanted = extensions.is_empty()
            || entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| {
                    extensions
                        .iter()
                        .any(|wanted| wanted.eq_ignore_ascii_case(ext))
                });

        if wanted {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Reads a document as UTF-8, falling back to Latin-1 for invalid input.
pub fn read_document_text(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(error) => {
            debug!(path = %path.display(), "not valid UTF-8, decoding as Latin-1");
            Ok(error.into_bytes().into_iter().map(char::from).collect())
        }
    }
}

/// `path` relative to `root`, `/`-separated on every platform.
pub fn relative_posix(root: &Path, path: &Path) -> Result<String, IngestError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| IngestError::OutsideRoot(path.to_path_buf()))?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

/// Builds the manifest record for one file on disk.
pub fn file_record(root: &Path, path: &Path) -> Result<FileRecord, IngestError> {
    let digest = digest_file(path)?;
    let metadata = fs::metadata(path)?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default();

    Ok(FileRecord {
        mtime,
        path: relative_posix(root, path)?,
        digest,
        size: metadata.len(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionStage {
    Scanning,
    Diffing,
    Processing(String),
    Pruning,
    Publishing,
    Done,
}

impl fmt::Display for IngestionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scanning => f.write_str("scanning"),
            Self::Diffing => f.write_str("diffing"),
            Self::Processing(path) => write!(f, "processing {path}"),
            Self::Pruning => f.write_str("pruning"),
            Self::Publishing => f.write_str("publishing"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Result of embedding and storing one new or changed file.
#[derive(Debug, Default)]
struct FileOutcome {
    chunks: usize,
    upserted: usize,
    deleted_old: usize,
    embedded_bytes: usize,
}

/// Incremental ingestion for one document root.
///
/// A run scans a subfolder, diffs it against the last published manifest,
/// re-embeds new and changed files, prunes superseded vectors and finally
/// publishes a manifest of the current scan. Any error aborts the run before
/// publishing, so the next run recomputes the same diff.
pub struct IngestionPipeline {
    doc_root: PathBuf,
    options: IngestionOptions,
}

impl IngestionPipeline {
    pub fn new(doc_root: impl Into<PathBuf>, options: IngestionOptions) -> Result<Self, IngestError> {
        let doc_root = doc_root.into();
        if !doc_root.exists() {
            return Err(IngestError::NotFound(doc_root));
        }
        if !doc_root.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "doc root is not a directory: {}",
                doc_root.display()
            )));
        }
        ChunkingConfig::from(&options).validate()?;
        Ok(Self { doc_root, options })
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    pub fn options(&self) -> &IngestionOptions {
        &self.options
    }

    /// Current records for `subfolder`, ordered by path.
    pub fn scan(&self, subfolder: &str) -> Result<Vec<FileRecord>, IngestError> {
        self.scope_prefix(subfolder)?;
        let folder = self.doc_root.join(subfolder);
        if !folder.is_dir() {
            return Err(IngestError::NotFound(folder));
        }

        discover_files(&folder, &self.options.include_extensions)
            .iter()
            .map(|path| file_record(&self.doc_root, path))
            .collect()
    }

    /// `/`-separated path of `subfolder` relative to the document root, the
    /// prefix shared by every manifest record a run over it owns.
    pub fn scope_prefix(&self, subfolder: &str) -> Result<String, IngestError> {
        let relative = Path::new(subfolder);
        let escapes = relative.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(IngestError::OutsideRoot(relative.to_path_buf()));
        }
        relative_posix(&self.doc_root, &self.doc_root.join(relative))
    }

    pub async fn run<S, E>(
        &self,
        subfolder: &str,
        store: &mut S,
        embedder: &E,
        manifest_path: &Path,
    ) -> Result<IngestionStats, IngestError>
    where
        S: VectorStore + ?Sized,
        E: Embedder + ?Sized,
    {
        let mut stage = IngestionStage::Scanning;
        debug!(%stage, subfolder, root = %self.doc_root.display(), "ingestion run started");
        let current = self.scan(subfolder)?;

        stage = IngestionStage::Diffing;
        debug!(%stage, files = current.len(), "scan complete");
        // Records of other subfolders are carried over as they are.
        let scope = self.scope_prefix(subfolder)?;
        let (previous, outside) = Manifest::load(manifest_path)?.split_scope(&scope);
        let changes = diff(&current, &previous);
        info!(
            scanned = current.len(),
            to_process = changes.to_process.len(),
            unchanged = changes.unchanged.len(),
            tombstones = changes.tombstones.len(),
            "manifest diff computed"
        );

        let mut stats = IngestionStats {
            files_scanned: current.len(),
            to_process: changes.to_process.len(),
            unchanged: changes.unchanged.len(),
            tombstones: changes.tombstones.len(),
            chunks_embedded: 0,
            vectors_upserted: 0,
            deleted_old_versions: 0,
            deleted_tombstones: 0,
            embedded_bytes: 0,
            manifest_path: manifest_path.to_path_buf(),
        };

        for record in &changes.to_process {
            stage = IngestionStage::Processing(record.path.clone());
            debug!(%stage, digest = %record.digest, "embedding file");
            let outcome = self
                .process_file(record, previous.get(&record.path), store, embedder)
                .await?;
            stats.chunks_embedded += outcome.chunks;
            stats.vectors_upserted += outcome.upserted;
            stats.deleted_old_versions += outcome.deleted_old;
            stats.embedded_bytes += outcome.embedded_bytes;
        }

        if self.options.delete_tombstones && !changes.tombstones.is_empty() {
            stage = IngestionStage::Pruning;
            debug!(%stage, tombstones = changes.tombstones.len(), "pruning tombstones");
            for tombstone in &changes.tombstones {
                let deleted = store
                    .delete_where(&MetadataFilter::file_version(&tombstone.path, &tombstone.digest))
                    .await?;
                stats.deleted_tombstones += deleted.len();
            }
        }

        stage = IngestionStage::Publishing;
        debug!(%stage, path = %manifest_path.display(), "publishing manifest");
        Manifest::from_records(outside.into_iter().chain(current)).publish(manifest_path)?;

        stage = IngestionStage::Done;
        info!(
            %stage,
            processed = stats.to_process,
            chunks = stats.chunks_embedded,
            deleted_old = stats.deleted_old_versions,
            deleted_tombstones = stats.deleted_tombstones,
            embedded_bytes = stats.embedded_bytes,
            "ingestion run finished"
        );
        Ok(stats)
    }

    async fn process_file<S, E>(
        &self,
        record: &FileRecord,
        prior: Option<&FileRecord>,
        store: &mut S,
        embedder: &E,
    ) -> Result<FileOutcome, IngestError>
    where
        S: VectorStore + ?Sized,
        E: Embedder + ?Sized,
    {
        let text = read_document_text(&self.doc_root.join(&record.path))?;
        let chunks: Vec<Chunk> =
            chunking::split(&record.path, &text, ChunkingConfig::from(&self.options))?.collect();

        let mut outcome = FileOutcome::default();

        if chunks.is_empty() {
            warn!(path = %record.path, "no chunks produced");
        } else {
            let ids: Vec<String> = chunks
                .iter()
                .map(|chunk| make_chunk_id(&record.path, &record.digest, chunk.index))
                .collect();
            let metadatas: Vec<Metadata> = chunks
                .iter()
                .map(|chunk| chunk_metadata(record, chunk))
                .collect();
            let texts: Vec<String> = chunks.into_iter().map(|chunk| chunk.text).collect();
            outcome.embedded_bytes = texts.iter().map(String::len).sum();

            let vectors = embedder.embed(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(IngestError::Embedding(EmbedError::InvalidResponse(format!(
                    "{} vectors returned for {} chunks of {}",
                    vectors.len(),
                    texts.len(),
                    record.path
                ))));
            }

            store.add(&ids, &vectors, Some(&metadatas)).await?;
            outcome.chunks = texts.len();
            outcome.upserted = ids.len();
        }

        // Old version goes only after the new one is stored.
        if self.options.delete_old_versions {
            if let Some(prior) = prior.filter(|prior| prior.digest != record.digest) {
                let deleted = store
                    .delete_where(&MetadataFilter::file_version(&prior.path, &prior.digest))
                    .await?;
                debug!(path = %record.path, old_digest = %prior.digest, deleted = deleted.len(), "old version pruned");
                outcome.deleted_old = deleted.len();
            }
        }

        Ok(outcome)
    }
}

fn chunk_metadata(record: &FileRecord, chunk: &Chunk) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("path".to_string(), json!(record.path));
    metadata.insert("sha256".to_string(), json!(record.digest));
    metadata.insert("chunk_index".to_string(), json!(chunk.index));
    metadata.insert("mtime".to_string(), json!(record.mtime));
    metadata
}
