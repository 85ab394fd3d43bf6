//! File manifest: the durable ledger of what the last successful ingestion
//! run observed on disk.
//!
//! On disk the manifest is a pretty-printed JSON object with sorted keys:
//!
//! ```json
//! {
//!   "files": [{"mtime": 1700000000.0, "path": "project1/a.md", "sha256": "…", "size": 12}],
//!   "generated_at": "2024-01-01T00:00:00Z",
//!   "version": "1"
//! }
//! ```
//!
//! It is only ever replaced wholesale through [`Manifest::publish`].

use crate::error::IngestError;
use crate::persist::write_atomic;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const MANIFEST_VERSION: &str = "1";

/// State of one source file at scan time.
///
/// Fields are declared in key order so serialized records have sorted keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Modification time as UNIX seconds.
    pub mtime: f64,
    /// Path relative to the document root, `/`-separated.
    pub path: String,
    #[serde(rename = "sha256")]
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(
        default,
        serialize_with = "serialize_files",
        deserialize_with = "deserialize_files"
    )]
    files: BTreeMap<String, FileRecord>,
    #[serde(
        default,
        serialize_with = "serialize_generated_at",
        deserialize_with = "deserialize_generated_at"
    )]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    MANIFEST_VERSION.to_string()
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            generated_at: None,
            version: default_version(),
        }
    }
}

/// Three-way partition produced by [`diff`], each list ordered by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestDiff {
    /// New paths and paths whose digest changed.
    pub to_process: Vec<FileRecord>,
    pub unchanged: Vec<FileRecord>,
    /// Previous records whose path no longer exists.
    pub tombstones: Vec<FileRecord>,
}

impl Manifest {
    /// Builds a manifest keeping one record per path; later records win.
    pub fn from_records(records: impl IntoIterator<Item = FileRecord>) -> Self {
        let mut manifest = Self::default();
        for record in records {
            manifest.files.insert(record.path.clone(), record);
        }
        manifest
    }

    /// Loads a published manifest, or an empty one when `path` does not exist.
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        if !path.exists() {
            debug!(path = %path.display(), "no manifest yet, starting fresh");
            return Ok(Self::default());
        }

        let content = fs::read(path)?;
        serde_json::from_slice(&content).map_err(|source| IngestError::CorruptManifest {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Atomically replaces the manifest at `path`, stamping `generated_at`
    /// when it is unset.
    pub fn publish(&mut self, path: &Path) -> Result<(), IngestError> {
        if self.generated_at.is_none() {
            self.generated_at = Some(Utc::now());
        }

        let mut payload = serde_json::to_vec_pretty(self)?;
        payload.push(b'\n');
        write_atomic(path, &payload)?;

        debug!(path = %path.display(), files = self.files.len(), "manifest published");
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    /// Records in path order.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|record| record.size).sum()
    }

    /// Splits off the records under `prefix` into their own manifest. The
    /// second half holds every other record, untouched, in path order.
    pub fn split_scope(self, prefix: &str) -> (Manifest, Vec<FileRecord>) {
        let (inside, outside): (Vec<FileRecord>, Vec<FileRecord>) = self
            .files
            .into_values()
            .partition(|record| in_scope(&record.path, prefix));
        let scoped = Manifest {
            files: inside
                .into_iter()
                .map(|record| (record.path.clone(), record))
                .collect(),
            generated_at: self.generated_at,
            version: self.version,
        };
        (scoped, outside)
    }
}

/// Whether the relative `path` lies under the `/`-separated folder `prefix`.
/// An empty prefix is the document root and covers every path.
pub fn in_scope(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Partitions the current scan against the previous manifest by path.
pub fn diff(current: &[FileRecord], previous: &Manifest) -> ManifestDiff {
    let mut current_by_path: HashMap<&str, &FileRecord> = HashMap::with_capacity(current.len());
    for record in current {
        if current_by_path.insert(record.path.as_str(), record).is_some() {
            warn!(path = %record.path, "duplicate path in scan, keeping the last record");
        }
    }
    let previous_by_path: HashMap<&str, &FileRecord> = previous
        .files
        .iter()
        .map(|(path, record)| (path.as_str(), record))
        .collect();

    let mut result = ManifestDiff::default();

    for (path, record) in &current_by_path {
        match previous_by_path.get(path) {
            Some(prior) if prior.digest == record.digest => {
                result.unchanged.push((*record).clone());
            }
            _ => result.to_process.push((*record).clone()),
        }
    }

    for (path, prior) in &previous_by_path {
        if !current_by_path.contains_key(path) {
            result.tombstones.push((*prior).clone());
        }
    }

    for records in [
        &mut result.to_process,
        &mut result.unchanged,
        &mut result.tombstones,
    ] {
        records.sort_unstable_by(|left, right| left.path.cmp(&right.path));
    }
    result
}

fn serialize_files<S>(files: &BTreeMap<String, FileRecord>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(files.values())
}

/// Anything other than a list of records reads as no records.
fn deserialize_files<'de, D>(deserializer: D) -> Result<BTreeMap<String, FileRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let records = match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value::<FileRecord>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(serde::de::Error::custom)?,
        other => {
            warn!(found = %other, "manifest files is not a list, treating as empty");
            Vec::new()
        }
    };
    Ok(records
        .into_iter()
        .map(|record| (record.path.clone(), record))
        .collect())
}

fn serialize_generated_at<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(timestamp) => {
            serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        None => serializer.serialize_str(""),
    }
}

/// Empty, missing or unparseable timestamps read as `None`.
fn deserialize_generated_at<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match Value::deserialize(deserializer)? {
        Value::String(raw) => raw,
        _ => return Ok(None),
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(timestamp) => Ok(Some(timestamp.with_timezone(&Utc))),
        Err(error) => {
            warn!(value = %raw, %error, "ignoring unparseable generated_at");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::temp_sibling;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn record(path: &str, digest: &str) -> FileRecord {
        FileRecord {
            mtime: 1_700_000_000.5,
            path: path.to_string(),
            digest: digest.to_string(),
            size: 42,
        }
    }

    #[test]
    fn missing_manifest_loads_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let manifest = Manifest::load(&dir.path().join("file_manifest.json"))?;
        assert!(manifest.is_empty());
        assert_eq!(manifest.version, "1");
        assert!(manifest.generated_at.is_none());
        Ok(())
    }

    #[test]
    fn corrupt_manifest_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("file_manifest.json");
        fs::write(&path, b"{ not json")?;
        let result = Manifest::load(&path);
        assert!(matches!(result, Err(IngestError::CorruptManifest { .. })));
        Ok(())
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("file_manifest.json");
        fs::write(&path, b"{}")?;
        let manifest = Manifest::load(&path)?;
        assert_eq!(manifest, Manifest::default());
        Ok(())
    }

    #[test]
    fn malformed_optional_keys_are_tolerated() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("file_manifest.json");

        for raw in [
            r#"{"files": null, "generated_at": "yesterday", "version": "1"}"#,
            r#"{"files": {"a.md": "oops"}, "generated_at": 7}"#,
            r#"{"files": "none", "generated_at": null}"#,
        ] {
            fs::write(&path, raw)?;
            let manifest = Manifest::load(&path)?;
            assert!(manifest.is_empty(), "{raw}");
            assert!(manifest.generated_at.is_none(), "{raw}");
        }

        fs::write(&path, r#"{"files": [{"path": "a.md"}]}"#)?;
        assert!(matches!(
            Manifest::load(&path),
            Err(IngestError::CorruptManifest { .. })
        ));
        Ok(())
    }

    #[test]
    fn scope_matches_whole_folder_components() {
        assert!(in_scope("project1/a.md", "project1"));
        assert!(in_scope("project1/sub/a.md", "project1/"));
        assert!(in_scope("a.md", ""));
        assert!(!in_scope("project10/a.md", "project1"));
        assert!(!in_scope("project1", "project1"));
    }

    #[test]
    fn split_scope_separates_other_folders() {
        let manifest = Manifest::from_records([
            record("project1/a.md", "1"),
            record("project2/b.md", "2"),
            record("top.md", "3"),
        ]);
        let (scoped, outside) = manifest.split_scope("project1");
        assert_eq!(scoped.len(), 1);
        assert!(scoped.get("project1/a.md").is_some());
        let outside: Vec<_> = outside.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(outside, vec!["project2/b.md", "top.md"]);
    }

    #[test]
    fn publish_writes_sorted_keys_and_stamps_time() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("data").join("file_manifest.json");
        let mut manifest = Manifest::from_records([record("b.md", "2"), record("a.md", "1")]);

        manifest.publish(&path)?;
        assert!(manifest.generated_at.is_some());

        let raw = fs::read_to_string(&path)?;
        let files_at = raw.find("\"files\"").unwrap_or(usize::MAX);
        let generated_at = raw.find("\"generated_at\"").unwrap_or(0);
        let version_at = raw.find("\"version\"").unwrap_or(0);
        assert!(files_at < generated_at && generated_at < version_at);
        assert!(raw.find("\"a.md\"") < raw.find("\"b.md\""));
        assert!(raw.contains("\"sha256\": \"1\""));

        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let stamp = value["generated_at"].as_str().unwrap_or_default();
        assert!(stamp.ends_with('Z'));

        let reloaded = Manifest::load(&path)?;
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("a.md"), Some(&record("a.md", "1")));
        Ok(())
    }

    #[test]
    fn stale_temp_file_never_shadows_published_manifest() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let path = dir.path().join("file_manifest.json");
        let mut manifest = Manifest::from_records([record("a.md", "1")]);
        manifest.publish(&path)?;

        // A run that died between writing the temp file and renaming it.
        fs::write(temp_sibling(&path), b"{\"files\": [")?;

        let survivor = Manifest::load(&path)?;
        assert_eq!(survivor.get("a.md").map(|r| r.digest.as_str()), Some("1"));

        let mut next = Manifest::from_records([record("a.md", "2")]);
        next.publish(&path)?;
        assert_eq!(
            Manifest::load(&path)?.get("a.md").map(|r| r.digest.clone()),
            Some("2".to_string())
        );
        Ok(())
    }

    #[test]
    fn from_records_keeps_one_record_per_path() {
        let manifest = Manifest::from_records([record("a.md", "1"), record("a.md", "2")]);
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get("a.md").map(|r| r.digest.as_str()), Some("2"));
    }

    #[test]
    fn diff_partitions_new_changed_unchanged_and_deleted() {
        let previous = Manifest::from_records([
            record("keep.md", "k"),
            record("edit.md", "old"),
            record("gone.md", "g"),
        ]);
        let current = vec![
            record("keep.md", "k"),
            record("edit.md", "new"),
            record("fresh.md", "f"),
        ];

        let result = diff(&current, &previous);
        let paths = |records: &[FileRecord]| {
            records
                .iter()
                .map(|r| r.path.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(paths(&result.to_process), vec!["edit.md", "fresh.md"]);
        assert_eq!(paths(&result.unchanged), vec!["keep.md"]);
        assert_eq!(paths(&result.tombstones), vec!["gone.md"]);
        assert_eq!(result.tombstones[0].digest, "g");
        assert_eq!(result.to_process[0].digest, "new");
    }

    #[test]
    fn diff_partition_is_complete_and_disjoint() {
        let previous = Manifest::from_records(
            (0..40).map(|index| record(&format!("f{index}.md"), &format!("d{}", index % 3))),
        );
        let current: Vec<_> = (20..70)
            .map(|index| record(&format!("f{index}.md"), &format!("d{}", index % 2)))
            .collect();

        let result = diff(&current, &previous);

        let processed: BTreeSet<_> = result.to_process.iter().map(|r| r.path.clone()).collect();
        let unchanged: BTreeSet<_> = result.unchanged.iter().map(|r| r.path.clone()).collect();
        let tombstones: BTreeSet<_> = result.tombstones.iter().map(|r| r.path.clone()).collect();

        let current_paths: BTreeSet<_> = current.iter().map(|r| r.path.clone()).collect();
        let previous_only: BTreeSet<_> = previous
            .records()
            .map(|r| r.path.clone())
            .filter(|path| !current_paths.contains(path))
            .collect();

        assert!(processed.is_disjoint(&unchanged));
        assert_eq!(
            processed.union(&unchanged).cloned().collect::<BTreeSet<_>>(),
            current_paths
        );
        assert_eq!(tombstones, previous_only);
        assert!(tombstones.is_disjoint(&current_paths));
    }

    #[test]
    fn diff_against_empty_manifest_processes_everything() {
        let current = vec![record("a.md", "1"), record("b.md", "2")];
        let result = diff(&current, &Manifest::default());
        assert_eq!(result.to_process.len(), 2);
        assert!(result.unchanged.is_empty());
        assert!(result.tombstones.is_empty());
    }
}
